//! POP3 adapter. No folder concept: a single implicit INBOX with sequential
//! message numbering. Headers come from `TOP n 0`.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls::TlsConnector;

use super::{Folder, MailError, MailboxSession, MessageHeader};
use crate::models::account::{Account, Credentials};
use crate::net::Dialer;

const INBOX: &str = "INBOX";

/// Plain TCP or implicit TLS, behind one stream type for BufStream.
enum Pop3Stream {
    Plain(TcpStream),
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl AsyncRead for Pop3Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Pop3Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub struct Pop3Mailbox {
    stream: BufStream<Pop3Stream>,
    count: u32,
}

pub async fn connect(
    account: &Account,
    credentials: &Credentials,
    dialer: &Dialer,
) -> Result<Pop3Mailbox, MailError> {
    let Credentials::Password { password } = credentials else {
        return Err(MailError::Auth(
            "pop3 requires password credentials".into(),
        ));
    };

    let tcp = dialer.dial(&account.host, account.port).await?;
    let stream = if account.use_tls {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Connection(e.to_string()))?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let tls_stream = tls
            .connect(&account.host, tcp)
            .await
            .map_err(|e| MailError::Connection(format!("tls handshake: {e}")))?;
        Pop3Stream::Tls(Box::new(tls_stream))
    } else {
        Pop3Stream::Plain(tcp)
    };

    let mut mailbox = Pop3Mailbox {
        stream: BufStream::new(stream),
        count: 0,
    };

    let greeting = mailbox.read_line().await?;
    if !greeting.starts_with("+OK") {
        return Err(MailError::Protocol(format!("bad greeting: {greeting}")));
    }

    let reply = mailbox.command(&format!("USER {}", account.email)).await?;
    if !reply.starts_with("+OK") {
        return Err(MailError::Auth(format!("USER rejected: {reply}")));
    }
    let reply = mailbox.command(&format!("PASS {}", password)).await?;
    if !reply.starts_with("+OK") {
        return Err(MailError::Auth(format!("PASS rejected: {reply}")));
    }

    let reply = mailbox.command("STAT").await?;
    mailbox.count = parse_stat(&reply)?;
    Ok(mailbox)
}

impl Pop3Mailbox {
    async fn read_line(&mut self) -> Result<String, MailError> {
        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;
        if n == 0 {
            return Err(MailError::Connection("server closed connection".into()));
        }
        Ok(line.trim_end().to_string())
    }

    async fn command(&mut self, line: &str) -> Result<String, MailError> {
        self.stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;
        self.stream
            .write_all(b"\r\n")
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;
        self.read_line().await
    }

    /// Read a dot-terminated multiline body, undoing byte-stuffing.
    async fn read_multiline(&mut self) -> Result<String, MailError> {
        let mut out = String::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Parse "+OK <count> <octets>".
fn parse_stat(reply: &str) -> Result<u32, MailError> {
    if !reply.starts_with("+OK") {
        return Err(MailError::Protocol(format!("STAT failed: {reply}")));
    }
    reply
        .split_whitespace()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| MailError::Protocol(format!("unparseable STAT reply: {reply}")))
}

/// Parse an RFC 5322 header block: unfold continuation lines, then collect
/// the address-bearing fields.
pub(crate) fn parse_header_block(raw: &str) -> MessageHeader {
    let mut unfolded: Vec<String> = Vec::new();
    for line in raw.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = unfolded.last_mut() {
                last.push(' ');
                last.push_str(line.trim_start());
            }
        } else {
            unfolded.push(line.to_string());
        }
    }

    let mut header = MessageHeader::default();
    for line in &unfolded {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let values = split_address_list(value);
        match name.trim().to_ascii_lowercase().as_str() {
            "from" => header.from.extend(values),
            "to" => header.to.extend(values),
            "cc" => header.cc.extend(values),
            "bcc" => header.bcc.extend(values),
            _ => {}
        }
    }
    header
}

fn split_address_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait::async_trait]
impl MailboxSession for Pop3Mailbox {
    async fn list_folders(&mut self) -> Result<Vec<Folder>, MailError> {
        Ok(vec![Folder {
            name: INBOX.to_string(),
            path: INBOX.to_string(),
            total: self.count,
        }])
    }

    async fn open_folder(&mut self, folder: &Folder) -> Result<u32, MailError> {
        if !folder.path.eq_ignore_ascii_case(INBOX) {
            return Err(MailError::Protocol(format!(
                "pop3 has a single implicit INBOX, no folder {}",
                folder.path
            )));
        }
        Ok(self.count)
    }

    async fn fetch_headers(
        &mut self,
        _folder: &Folder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageHeader>, MailError> {
        let mut out = Vec::new();
        let last = (offset + limit).min(self.count);
        for msg_no in (offset + 1)..=last {
            let reply = self.command(&format!("TOP {} 0", msg_no)).await?;
            if !reply.starts_with("+OK") {
                return Err(MailError::Protocol(format!(
                    "TOP {msg_no} failed: {reply}"
                )));
            }
            let block = self.read_multiline().await?;
            out.push(parse_header_block(&block));
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<(), MailError> {
        let _ = self.command("QUIT").await;
        Ok(())
    }
}
