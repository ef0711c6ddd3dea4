//! Exchange-style REST adapter (Microsoft Graph shape). Folder listing comes
//! from `mailFolders`; `$skip`/`$top` pages stand in for a folder cursor.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Folder, MailError, MailboxSession, MessageHeader};
use crate::models::account::{Account, Credentials};
use crate::net::Dialer;

const DEFAULT_BASE: &str = "https://graph.microsoft.com/v1.0";
const FOLDER_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct GraphFolder {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "totalItemCount", default)]
    total_item_count: u32,
}

#[derive(Debug, Deserialize, Default)]
struct GraphMessage {
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<Recipient>,
    #[serde(rename = "ccRecipients", default)]
    cc_recipients: Vec<Recipient>,
    #[serde(rename = "bccRecipients", default)]
    bcc_recipients: Vec<Recipient>,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    #[serde(rename = "emailAddress")]
    email_address: EmailAddress,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    address: String,
}

fn recipient_addresses(recipients: &[Recipient]) -> Vec<String> {
    recipients
        .iter()
        .map(|r| r.email_address.address.clone())
        .filter(|a| !a.is_empty())
        .collect()
}

pub struct ExchangeMailbox {
    client: reqwest::Client,
    base: String,
    token: String,
    request_timeout: Duration,
}

pub fn connect(
    account: &Account,
    credentials: &Credentials,
    dialer: &Dialer,
    request_timeout: Duration,
) -> Result<ExchangeMailbox, MailError> {
    let Credentials::OAuth2 { access_token, .. } = credentials else {
        return Err(MailError::Auth(
            "exchange requires an oauth2 token pair".into(),
        ));
    };

    let base = account
        .endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE.to_string());
    let mut builder = reqwest::Client::builder().timeout(request_timeout);
    if let Some(proxy) = dialer.reqwest_proxy()? {
        builder = builder.proxy(proxy);
    }
    let client = builder
        .build()
        .map_err(|e| MailError::Connection(e.to_string()))?;

    Ok(ExchangeMailbox {
        client,
        base: base.trim_end_matches('/').to_string(),
        token: access_token.clone(),
        request_timeout,
    })
}

impl ExchangeMailbox {
    fn request_err(&self, e: reqwest::Error) -> MailError {
        if e.is_timeout() {
            MailError::Timeout(self.request_timeout)
        } else {
            MailError::Connection(e.to_string())
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, MailError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.request_err(e))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(MailError::Auth(format!("server returned {status}")));
        }
        if status.as_u16() == 429 {
            return Err(MailError::Connection("rate limited (429)".into()));
        }
        if !status.is_success() {
            return Err(MailError::Protocol(format!("unexpected status {status}")));
        }
        resp.json()
            .await
            .map_err(|e| MailError::Protocol(format!("malformed response: {e}")))
    }
}

#[async_trait::async_trait]
impl MailboxSession for ExchangeMailbox {
    async fn list_folders(&mut self) -> Result<Vec<Folder>, MailError> {
        let url = format!("{}/me/mailFolders?$top={}", self.base, FOLDER_PAGE);
        let listing: ValueList<GraphFolder> = self.get_json(&url).await?;
        Ok(listing
            .value
            .into_iter()
            .map(|f| Folder {
                name: f.display_name,
                path: f.id,
                total: f.total_item_count,
            })
            .collect())
    }

    async fn open_folder(&mut self, folder: &Folder) -> Result<u32, MailError> {
        let url = format!("{}/me/mailFolders/{}", self.base, folder.path);
        let current: GraphFolder = self.get_json(&url).await?;
        Ok(current.total_item_count)
    }

    async fn fetch_headers(
        &mut self,
        folder: &Folder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageHeader>, MailError> {
        let url = format!(
            "{}/me/mailFolders/{}/messages?$skip={}&$top={}&$select=from,toRecipients,ccRecipients,bccRecipients",
            self.base, folder.path, offset, limit
        );
        let page: ValueList<GraphMessage> = self.get_json(&url).await?;
        Ok(page
            .value
            .into_iter()
            .map(|m| MessageHeader {
                from: m
                    .from
                    .as_ref()
                    .map(|r| recipient_addresses(std::slice::from_ref(r)))
                    .unwrap_or_default(),
                to: recipient_addresses(&m.to_recipients),
                cc: recipient_addresses(&m.cc_recipients),
                bcc: recipient_addresses(&m.bcc_recipients),
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), MailError> {
        // stateless HTTP; nothing to release
        Ok(())
    }
}
