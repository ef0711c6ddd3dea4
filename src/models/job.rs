use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution of mailbox crawling for one account.
///
/// Status moves exactly once through pending -> running -> {completed, failed};
/// terminal rows are never re-entered (a retry is a fresh job).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: String,
    pub account_id: String,
    pub name: Option<String>,
    pub status: JobStatus,
    /// Requested folder names; empty means the full adapter listing
    pub folders: Vec<String>,
    /// Per-job proxy override; wins over the account's stored proxy
    pub proxy_id: Option<String>,
    pub current_count: i64,
    pub result_count: i64,
    pub processed_folders: i64,
    pub total_folders: i64,
    pub error: Option<String>,
    pub parent_id: Option<String>,
    pub children_total: i64,
    pub children_done: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl SyncJob {
    pub fn new(
        account_id: &str,
        name: Option<String>,
        folders: Vec<String>,
        proxy_id: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            name,
            status: JobStatus::Pending,
            folders,
            proxy_id,
            current_count: 0,
            result_count: 0,
            processed_folders: 0,
            total_folders: 0,
            error: None,
            parent_id,
            children_total: 0,
            children_done: 0,
            created_at: Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Parent job for a batch run over several accounts. The parent never
    /// occupies a worker; it only aggregates child completion counts.
    pub fn new_parent(name: Option<String>, children_total: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: String::new(),
            name,
            status: JobStatus::Running,
            folders: Vec::new(),
            proxy_id: None,
            current_count: 0,
            result_count: 0,
            processed_folders: 0,
            total_folders: 0,
            error: None,
            parent_id: None,
            children_total,
            children_done: 0,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }
}
