#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use mailsweep::config::SyncConfig;
use mailsweep::db::{self, queries};
use mailsweep::mailbox::{Folder, MailError, MailboxSession, MessageHeader, SessionFactory};
use mailsweep::models::account::{Account, ConnectionStatus, Credentials, MailProtocol};
use mailsweep::models::job::SyncJob;
use mailsweep::models::proxy::{Proxy, ProxyProtocol};
use mailsweep::net::Dialer;
use mailsweep::services::job_queue::JobQueue;
use mailsweep::services::progress::ProgressPublisher;

pub fn header(from: &str) -> MessageHeader {
    MessageHeader {
        from: vec![from.to_string()],
        ..Default::default()
    }
}

pub fn headers(addrs: &[&str]) -> Vec<MessageHeader> {
    addrs.iter().map(|a| header(a)).collect()
}

pub struct FakeFolder {
    pub name: String,
    pub headers: Vec<MessageHeader>,
    /// Return a timeout once this many messages have been served
    pub timeout_after: Option<u32>,
    /// Return a protocol error once this many messages have been served
    pub fail_after: Option<u32>,
}

pub fn fake_folder(name: &str, headers: Vec<MessageHeader>) -> FakeFolder {
    FakeFolder {
        name: name.to_string(),
        headers,
        timeout_after: None,
        fail_after: None,
    }
}

pub struct FakeMailbox {
    pub folders: Vec<FakeFolder>,
    pub fetch_delay: Option<Duration>,
    pub closed: Arc<AtomicBool>,
}

impl FakeMailbox {
    pub fn new(folders: Vec<FakeFolder>) -> Self {
        Self {
            folders,
            fetch_delay: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }
}

#[async_trait]
impl MailboxSession for FakeMailbox {
    async fn list_folders(&mut self) -> Result<Vec<Folder>, MailError> {
        Ok(self
            .folders
            .iter()
            .map(|f| Folder {
                name: f.name.clone(),
                path: f.name.clone(),
                total: f.headers.len() as u32,
            })
            .collect())
    }

    async fn open_folder(&mut self, folder: &Folder) -> Result<u32, MailError> {
        self.folders
            .iter()
            .find(|f| f.name == folder.path)
            .map(|f| f.headers.len() as u32)
            .ok_or_else(|| MailError::Protocol(format!("no folder {}", folder.path)))
    }

    async fn fetch_headers(
        &mut self,
        folder: &Folder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageHeader>, MailError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let f = self
            .folders
            .iter()
            .find(|f| f.name == folder.path)
            .ok_or_else(|| MailError::Protocol(format!("no folder {}", folder.path)))?;
        if let Some(cut) = f.timeout_after {
            if offset >= cut {
                return Err(MailError::Timeout(Duration::from_secs(1)));
            }
        }
        if let Some(cut) = f.fail_after {
            if offset >= cut {
                return Err(MailError::Protocol("injected server failure".into()));
            }
        }
        let mut end = (offset + limit).min(f.headers.len() as u32);
        if let Some(cut) = f.timeout_after {
            end = end.min(cut);
        }
        if let Some(cut) = f.fail_after {
            end = end.min(cut);
        }
        Ok(f.headers[offset as usize..end as usize].to_vec())
    }

    async fn close(&mut self) -> Result<(), MailError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub enum Script {
    Session(FakeMailbox),
    AuthFail,
    ConnectFail,
}

pub struct FakeFactory {
    scripts: Mutex<VecDeque<Script>>,
}

impl FakeFactory {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }

    pub fn single(mailbox: FakeMailbox) -> Arc<Self> {
        Self::new(vec![Script::Session(mailbox)])
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(
        &self,
        _account: &Account,
        _credentials: &Credentials,
        _dialer: &Dialer,
    ) -> Result<Box<dyn MailboxSession>, MailError> {
        match self.scripts.lock().unwrap().pop_front() {
            Some(Script::Session(mailbox)) => Ok(Box::new(mailbox)),
            Some(Script::AuthFail) => Err(MailError::Auth("invalid credentials".into())),
            Some(Script::ConnectFail) => Err(MailError::Connection("connection refused".into())),
            None => Err(MailError::Connection("no scripted session".into())),
        }
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        workers: 2,
        connect_timeout: Duration::from_secs(5),
        fetch_timeout: Duration::from_secs(2),
        proxy_probe_timeout: Duration::from_millis(250),
        fetch_batch: 3,
        flush_every: 2,
        ..SyncConfig::default()
    }
}

pub async fn setup(
    factory: Arc<dyn SessionFactory>,
) -> (SqlitePool, Arc<JobQueue>, ProgressPublisher) {
    let pool = db::connect_memory().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let publisher = ProgressPublisher::new();
    let queue = JobQueue::new(pool.clone(), publisher.clone(), factory, test_config());
    queue.start();
    (pool, queue, publisher)
}

pub async fn seed_account(pool: &SqlitePool, id: &str) -> Account {
    let credentials = Credentials::Password {
        password: "secret".into(),
    };
    let now = db::now_epoch();
    let account = Account {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        protocol: MailProtocol::Imap,
        host: "imap.example.com".into(),
        port: 993,
        use_tls: true,
        endpoint: None,
        credentials_encrypted: Account::encode_credentials(&credentials).unwrap(),
        status: ConnectionStatus::Disconnected,
        proxy_id: None,
        last_sync_ts: None,
        last_error: None,
        created_at: now,
        updated_at: now,
        credentials: None,
    };
    queries::insert_account(pool, &account).await.unwrap();
    account
}

pub async fn seed_proxy(pool: &SqlitePool, id: &str, host: &str, port: u16) -> Proxy {
    let proxy = Proxy {
        id: id.to_string(),
        host: host.to_string(),
        port,
        protocol: ProxyProtocol::Socks5,
        username: None,
        password: None,
    };
    queries::insert_proxy(pool, &proxy).await.unwrap();
    proxy
}

pub async fn wait_terminal(pool: &SqlitePool, job_id: &str, timeout: Duration) -> SyncJob {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = queries::get_job(pool, job_id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not reach a terminal state in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the job's flushed message count reaches `count`.
pub async fn wait_progress(pool: &SqlitePool, job_id: &str, count: i64, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = queries::get_job(pool, job_id).await.unwrap() {
            if job.current_count >= count {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} never reached {count} processed messages"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
