//! IMAP adapter: dialer TCP stream, optional TLS, LOGIN or XOAUTH2, LIST +
//! EXAMINE for folders, FETCH (ENVELOPE) batches for address-bearing headers.

use std::fmt::Debug;

use async_imap::imap_proto::Address;
use async_imap::types::NameAttribute;
use async_imap::{Client, Session};
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use tokio_native_tls::native_tls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{Folder, MailError, MailboxSession, MessageHeader};
use crate::models::account::{Account, Credentials};
use crate::net::Dialer;

pub struct ImapMailbox<S> {
    session: Session<S>,
    selected: Option<String>,
}

/// XOAUTH2 SASL initial response: user={email}\x01auth=Bearer {token}\x01\x01
pub fn xoauth2_string(email: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", email, access_token)
}

struct XOAuth2 {
    user: String,
    token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        xoauth2_string(&self.user, &self.token)
    }
}

fn imap_err(e: async_imap::error::Error) -> MailError {
    match e {
        async_imap::error::Error::Io(io) => MailError::Connection(io.to_string()),
        other => MailError::Protocol(other.to_string()),
    }
}

async fn authenticate<S>(
    client: Client<S>,
    account: &Account,
    credentials: &Credentials,
) -> Result<Session<S>, MailError>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    match credentials {
        Credentials::Password { password } => client
            .login(&account.email, password)
            .await
            .map_err(|(e, _)| MailError::Auth(format!("login failed: {e}"))),
        Credentials::OAuth2 { access_token, .. } => {
            let auth = XOAuth2 {
                user: account.email.clone(),
                token: access_token.clone(),
            };
            client
                .authenticate("XOAUTH2", auth)
                .await
                .map_err(|(e, _)| MailError::Auth(format!("xoauth2 failed: {e}")))
        }
        Credentials::Cookies { .. } => Err(MailError::Auth(
            "cookie credentials cannot authenticate an imap session".into(),
        )),
    }
}

pub async fn connect(
    account: &Account,
    credentials: &Credentials,
    dialer: &Dialer,
) -> Result<Box<dyn MailboxSession>, MailError> {
    let tcp = dialer.dial(&account.host, account.port).await?;

    if account.use_tls {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Connection(e.to_string()))?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let tls_stream = tls
            .connect(&account.host, tcp)
            .await
            .map_err(|e| MailError::Connection(format!("tls handshake: {e}")))?;
        let client = Client::new(tls_stream.compat());
        let session = authenticate(client, account, credentials).await?;
        Ok(Box::new(ImapMailbox {
            session,
            selected: None,
        }))
    } else {
        let client = Client::new(tcp.compat());
        let session = authenticate(client, account, credentials).await?;
        Ok(Box::new(ImapMailbox {
            session,
            selected: None,
        }))
    }
}

fn address_list(addresses: Option<&Vec<Address<'_>>>) -> Vec<String> {
    let mut out = Vec::new();
    let Some(addresses) = addresses else {
        return out;
    };
    for addr in addresses {
        let (Some(mailbox), Some(host)) = (addr.mailbox.as_ref(), addr.host.as_ref()) else {
            continue;
        };
        let (Ok(mailbox), Ok(host)) = (std::str::from_utf8(mailbox), std::str::from_utf8(host))
        else {
            continue;
        };
        out.push(format!("{}@{}", mailbox, host));
    }
    out
}

#[async_trait::async_trait]
impl<S> MailboxSession for ImapMailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    async fn list_folders(&mut self) -> Result<Vec<Folder>, MailError> {
        let mut names = Vec::new();
        {
            let mut stream = self
                .session
                .list(None, Some("*"))
                .await
                .map_err(imap_err)?;
            while let Some(item) = stream.next().await {
                let name = item.map_err(imap_err)?;
                if name
                    .attributes()
                    .iter()
                    .any(|a| matches!(a, NameAttribute::NoSelect))
                {
                    continue;
                }
                names.push(name.name().to_string());
            }
        }

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            // EXAMINE is read-only; gives the message count without touching flags
            let mailbox = self.session.examine(&name).await.map_err(imap_err)?;
            out.push(Folder {
                path: name.clone(),
                name,
                total: mailbox.exists,
            });
        }
        self.selected = None;
        Ok(out)
    }

    async fn open_folder(&mut self, folder: &Folder) -> Result<u32, MailError> {
        let mailbox = self
            .session
            .select(&folder.path)
            .await
            .map_err(imap_err)?;
        self.selected = Some(folder.path.clone());
        Ok(mailbox.exists)
    }

    async fn fetch_headers(
        &mut self,
        folder: &Folder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageHeader>, MailError> {
        if self.selected.as_deref() != Some(folder.path.as_str()) {
            self.open_folder(folder).await?;
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sequence = format!("{}:{}", offset + 1, offset + limit);

        let mut out = Vec::new();
        let mut stream = self
            .session
            .fetch(&sequence, "(ENVELOPE)")
            .await
            .map_err(imap_err)?;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(imap_err)?;
            let header = match fetch.envelope() {
                Some(envelope) => MessageHeader {
                    from: address_list(envelope.from.as_ref()),
                    to: address_list(envelope.to.as_ref()),
                    cc: address_list(envelope.cc.as_ref()),
                    bcc: address_list(envelope.bcc.as_ref()),
                },
                None => MessageHeader::default(),
            };
            out.push(header);
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<(), MailError> {
        let _ = self.session.logout().await;
        Ok(())
    }
}
