//! Progress publisher: broadcast fan-out of job/account state changes.
//! Delivery is best-effort with no backlog; an observer that subscribes after
//! an event reads current state from the job record instead. Per-job events
//! are published in the order the controller observes them.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::account::ConnectionStatus;
use crate::models::job::JobStatus;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressEventKind {
    SyncStarted,
    SyncProgress,
    SyncMessageCount,
    SyncCompleted,
    SyncFailed,
    AccountStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_job_id: Option<String>,
    pub account_id: String,
    pub processed: i64,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<i64>,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct ProgressPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn job_event(
        &self,
        kind: ProgressEventKind,
        job_id: &str,
        account_id: &str,
        processed: i64,
        total: i64,
        status: Option<JobStatus>,
        error: Option<&str>,
    ) {
        self.publish(ProgressEvent {
            kind,
            sync_job_id: Some(job_id.to_string()),
            account_id: account_id.to_string(),
            processed,
            total,
            status: status.map(|s| s.as_str().to_string()),
            error: error.map(str::to_string),
            last_sync: None,
            timestamp: Utc::now().timestamp(),
        });
    }

    pub fn account_status(
        &self,
        account_id: &str,
        status: ConnectionStatus,
        last_sync: Option<i64>,
        error: Option<&str>,
    ) {
        self.publish(ProgressEvent {
            kind: ProgressEventKind::AccountStatus,
            sync_job_id: None,
            account_id: account_id.to_string(),
            processed: 0,
            total: 0,
            status: Some(status.as_str().to_string()),
            error: error.map(str::to_string),
            last_sync,
            timestamp: Utc::now().timestamp(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_shape_matches_wire_contract() {
        let publisher = ProgressPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.job_event(
            ProgressEventKind::SyncProgress,
            "job-1",
            "acc-1",
            5,
            10,
            Some(JobStatus::Running),
            None,
        );
        let event = rx.try_recv().unwrap();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "SYNC_PROGRESS");
        assert_eq!(value["syncJobId"], "job-1");
        assert_eq!(value["accountId"], "acc-1");
        assert_eq!(value["processed"], 5);
        assert_eq!(value["total"], 10);
        assert_eq!(value["status"], "running");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let publisher = ProgressPublisher::new();
        publisher.account_status("acc-1", ConnectionStatus::Connected, Some(1), None);
    }
}
