use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::account::MailProtocol;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub sync: SyncConfig,
}

/// Tunables for the sync engine, all overridable from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed worker pool size; at most this many jobs run concurrently
    pub workers: usize,
    /// Bound on protocol handshake (connect + auth)
    pub connect_timeout: Duration,
    /// Bound on a single header-batch fetch
    pub fetch_timeout: Duration,
    /// Bound on the pre-flight proxy connectivity probe
    pub proxy_probe_timeout: Duration,
    /// Messages per header fetch batch
    pub fetch_batch: u32,
    /// Flush progress/addresses after this many messages (and at every
    /// folder boundary regardless)
    pub flush_every: u32,
    /// A running job whose heartbeat is older than this is marked stalled
    pub stall_after: Duration,
    /// Protocols whose fetch timeouts close the job as a partial success
    /// instead of a failure
    pub timeout_partial_protocols: HashSet<MailProtocol>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            connect_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
            proxy_probe_timeout: Duration::from_secs(10),
            fetch_batch: 50,
            flush_every: 25,
            stall_after: Duration::from_secs(300),
            timeout_partial_protocols: all_protocols(),
        }
    }
}

fn all_protocols() -> HashSet<MailProtocol> {
    [
        MailProtocol::Imap,
        MailProtocol::Pop3,
        MailProtocol::Exchange,
        MailProtocol::WebSession,
    ]
    .into_iter()
    .collect()
}

impl SyncConfig {
    pub fn is_timeout_partial(&self, protocol: MailProtocol) -> bool {
        self.timeout_partial_protocols.contains(&protocol)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("SYNC_WORKERS", defaults.workers),
            connect_timeout: Duration::from_secs(env_parse(
                "SYNC_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            fetch_timeout: Duration::from_secs(env_parse(
                "SYNC_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )),
            proxy_probe_timeout: Duration::from_secs(env_parse(
                "SYNC_PROXY_PROBE_TIMEOUT_SECS",
                defaults.proxy_probe_timeout.as_secs(),
            )),
            fetch_batch: env_parse("SYNC_FETCH_BATCH", defaults.fetch_batch).max(1),
            flush_every: env_parse("SYNC_FLUSH_EVERY", defaults.flush_every).max(1),
            stall_after: Duration::from_secs(env_parse(
                "SYNC_STALL_AFTER_SECS",
                defaults.stall_after.as_secs(),
            )),
            timeout_partial_protocols: env::var("SYNC_TIMEOUT_PARTIAL_PROTOCOLS")
                .ok()
                .map(|v| parse_protocol_list(&v))
                .unwrap_or(defaults.timeout_partial_protocols),
        }
    }
}

fn parse_protocol_list(value: &str) -> HashSet<MailProtocol> {
    value
        .split(',')
        .filter_map(|p| MailProtocol::from_str(p.trim()))
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://mailsweep.db".into()),
            port: env_parse("PORT", 3030),
            sync: SyncConfig::from_env(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
