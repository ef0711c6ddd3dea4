//! Protocol adapters: one session trait over a closed set of mailbox
//! protocol implementations, dispatched exhaustively by account protocol.

pub mod exchange;
pub mod imap;
pub mod pop3;
pub mod websession;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::account::{Account, Credentials, MailProtocol};
use crate::net::Dialer;

/// Typed errors surfaced by adapters and the proxy connector. The sync
/// controller is the single place that turns these into a terminal job state.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid proxy config: {0}")]
    ProxyConfig(String),
    #[error("proxy unreachable: {0}")]
    ProxyUnreachable(String),
}

impl MailError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::ProxyConfig(_) => "proxy-config",
            Self::ProxyUnreachable(_) => "proxy-unreachable",
        }
    }

    /// Timeouts are the one recoverable failure: the controller may close the
    /// job as a partial success instead of failing it.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Folder descriptor. `path` is the protocol-native handle (IMAP mailbox
/// name, Graph folder id, ...); `name` is what users see and request.
#[derive(Debug, Clone, Serialize)]
pub struct Folder {
    pub name: String,
    pub path: String,
    pub total: u32,
}

/// Address-bearing header fields of one message, as raw strings; the
/// extractor normalizes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// One open protocol session against one mailbox.
///
/// Header listing is offset-based from 0 and restartable per folder; the
/// caller tracks its own offset, so a reopened folder is never double-counted
/// within a run.
#[async_trait]
pub trait MailboxSession: Send {
    async fn list_folders(&mut self) -> Result<Vec<Folder>, MailError>;

    /// Open a folder and return its current message total.
    async fn open_folder(&mut self, folder: &Folder) -> Result<u32, MailError>;

    /// Fetch up to `limit` message headers starting at `offset` (0-based).
    async fn fetch_headers(
        &mut self,
        folder: &Folder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageHeader>, MailError>;

    /// Release the session. Called on every exit path.
    async fn close(&mut self) -> Result<(), MailError>;
}

/// Seam between the sync controller and concrete protocol clients; tests
/// inject scripted sessions through this.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        account: &Account,
        credentials: &Credentials,
        dialer: &Dialer,
    ) -> Result<Box<dyn MailboxSession>, MailError>;
}

/// The real factory: exhaustive dispatch over the protocol enum, bounded by
/// the handshake timeout.
pub struct ProtocolFactory {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl ProtocolFactory {
    pub fn new(handshake_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for ProtocolFactory {
    async fn open(
        &self,
        account: &Account,
        credentials: &Credentials,
        dialer: &Dialer,
    ) -> Result<Box<dyn MailboxSession>, MailError> {
        let opened = async {
            match account.protocol {
                MailProtocol::Imap => imap::connect(account, credentials, dialer).await,
                MailProtocol::Pop3 => pop3::connect(account, credentials, dialer)
                    .await
                    .map(|s| Box::new(s) as Box<dyn MailboxSession>),
                MailProtocol::Exchange => {
                    exchange::connect(account, credentials, dialer, self.request_timeout)
                        .map(|s| Box::new(s) as Box<dyn MailboxSession>)
                }
                MailProtocol::WebSession => {
                    websession::connect(account, credentials, dialer, self.request_timeout)
                        .map(|s| Box::new(s) as Box<dyn MailboxSession>)
                }
            }
        };
        match tokio::time::timeout(self.handshake_timeout, opened).await {
            Ok(result) => result,
            Err(_) => Err(MailError::Timeout(self.handshake_timeout)),
        }
    }
}
