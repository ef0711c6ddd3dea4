//! Job queue and worker pool: FIFO admission, bounded concurrency, one
//! running-or-queued job per account, cooperative cancellation, and a
//! heartbeat watchdog so a hung worker never leaves a job `running` forever.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::db::queries;
use crate::mailbox::SessionFactory;
use crate::models::account::ConnectionStatus;
use crate::models::job::{JobStatus, SyncJob};
use crate::services::progress::{ProgressEventKind, ProgressPublisher};
use crate::services::sync_service;

/// Cooperative stop flag, checked by the controller at batch and folder
/// granularity.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Last-signs-of-life marker for a running job, bumped on every flush.
#[derive(Clone)]
pub struct Heartbeat(Arc<AtomicI64>);

impl Heartbeat {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(crate::db::now_epoch())))
    }

    pub fn beat(&self) {
        self.0.store(crate::db::now_epoch(), Ordering::SeqCst);
    }

    pub fn idle_secs(&self) -> i64 {
        crate::db::now_epoch() - self.0.load(Ordering::SeqCst)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum SubmitError {
    AccountNotFound,
    /// A job for this account is already queued or running
    AccountBusy,
    Invalid(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub enum StopError {
    NotFound,
    AlreadyTerminal,
    Internal(anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub account_id: String,
    pub folders: Vec<String>,
    pub proxy_id: Option<String>,
    pub name: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Default)]
struct QueueState {
    busy_accounts: HashSet<String>,
    cancel_flags: HashMap<String, CancelFlag>,
    heartbeats: HashMap<String, (String, Heartbeat)>,
}

pub struct JobQueue {
    pool: SqlitePool,
    publisher: ProgressPublisher,
    factory: Arc<dyn SessionFactory>,
    config: SyncConfig,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    state: std::sync::Mutex<QueueState>,
}

impl JobQueue {
    pub fn new(
        pool: SqlitePool,
        publisher: ProgressPublisher,
        factory: Arc<dyn SessionFactory>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pool,
            publisher,
            factory,
            config,
            tx,
            rx: Mutex::new(rx),
            state: std::sync::Mutex::new(QueueState::default()),
        })
    }

    /// Spawn the fixed worker pool and the stall watchdog.
    pub fn start(self: &Arc<Self>) {
        for worker in 0..self.config.workers.max(1) {
            let queue = self.clone();
            tokio::spawn(async move { queue.worker_loop(worker).await });
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.watchdog_loop().await });
    }

    /// Validate and enqueue one sync job; returns the pending job record
    /// immediately (results are observed via polling or the event stream).
    pub async fn submit(&self, request: SyncRequest) -> Result<SyncJob, SubmitError> {
        if request
            .folders
            .iter()
            .any(|f| f.trim().is_empty())
        {
            return Err(SubmitError::Invalid(
                "folder names must be non-empty".into(),
            ));
        }
        let account = queries::get_account(&self.pool, &request.account_id)
            .await
            .map_err(SubmitError::Internal)?
            .ok_or(SubmitError::AccountNotFound)?;
        if let Some(proxy_id) = &request.proxy_id {
            queries::get_proxy(&self.pool, proxy_id)
                .await
                .map_err(SubmitError::Internal)?
                .ok_or_else(|| SubmitError::Invalid(format!("proxy {proxy_id} not found")))?;
        }

        {
            let mut state = self.state.lock().unwrap();
            if !state.busy_accounts.insert(account.id.clone()) {
                return Err(SubmitError::AccountBusy);
            }
        }

        let job = SyncJob::new(
            &account.id,
            request.name,
            request.folders,
            request.proxy_id,
            request.parent_id,
        );
        if let Err(e) = queries::create_job(&self.pool, &job).await {
            self.state
                .lock()
                .unwrap()
                .busy_accounts
                .remove(&account.id);
            return Err(SubmitError::Internal(e));
        }
        self.state
            .lock()
            .unwrap()
            .cancel_flags
            .insert(job.id.clone(), CancelFlag::default());
        // receiver lives as long as the queue
        let _ = self.tx.send(job.id.clone());
        info!(job = %job.id, account = %account.id, "job queued");
        Ok(job)
    }

    /// Batch run: one parent job plus a child job per account. All accounts
    /// are validated and reserved up front so the batch is all-or-nothing at
    /// admission time.
    pub async fn submit_batch(
        &self,
        account_ids: Vec<String>,
        folders: Vec<String>,
        name: Option<String>,
    ) -> Result<(SyncJob, Vec<SyncJob>), SubmitError> {
        if account_ids.is_empty() {
            return Err(SubmitError::Invalid("no accounts in batch".into()));
        }
        let mut deduped = Vec::new();
        for id in account_ids {
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }

        for id in &deduped {
            queries::get_account(&self.pool, id)
                .await
                .map_err(SubmitError::Internal)?
                .ok_or(SubmitError::AccountNotFound)?;
        }
        {
            let state = self.state.lock().unwrap();
            if deduped.iter().any(|id| state.busy_accounts.contains(id)) {
                return Err(SubmitError::AccountBusy);
            }
        }

        let parent = SyncJob::new_parent(name.clone(), deduped.len() as i64);
        queries::create_job(&self.pool, &parent)
            .await
            .map_err(SubmitError::Internal)?;

        let mut children = Vec::with_capacity(deduped.len());
        for id in &deduped {
            let request = SyncRequest {
                account_id: id.clone(),
                folders: folders.clone(),
                proxy_id: None,
                name: name.clone(),
                parent_id: Some(parent.id.clone()),
            };
            match self.submit(request).await {
                Ok(child) => children.push(child),
                Err(e) => {
                    // an account grabbed between validation and submit: count
                    // the child as done so the parent can still complete
                    warn!(parent = %parent.id, account = %id, "batch child rejected: {e:?}");
                    let _ = sqlx::query(
                        "UPDATE sync_jobs SET children_done = children_done + 1 WHERE id = ?",
                    )
                    .bind(&parent.id)
                    .execute(&self.pool)
                    .await;
                    let _ = sqlx::query(
                        r#"
                        UPDATE sync_jobs SET status = 'completed', completed_at = ?
                        WHERE id = ? AND status = 'running' AND children_done >= children_total
                        "#,
                    )
                    .bind(crate::db::now_epoch())
                    .bind(&parent.id)
                    .execute(&self.pool)
                    .await;
                }
            }
        }
        Ok((parent, children))
    }

    /// Set the cooperative cancellation flag for a queued or running job.
    pub async fn stop(&self, job_id: &str) -> Result<(), StopError> {
        let flag = {
            let state = self.state.lock().unwrap();
            state.cancel_flags.get(job_id).cloned()
        };
        if let Some(flag) = flag {
            flag.cancel();
            info!(job = %job_id, "stop requested");
            return Ok(());
        }
        match queries::get_job(&self.pool, job_id)
            .await
            .map_err(StopError::Internal)?
        {
            None => Err(StopError::NotFound),
            Some(job) if job.status.is_terminal() => Err(StopError::AlreadyTerminal),
            // known to the store but not to this queue (e.g. orphaned by a
            // restart); the watchdog path owns those
            Some(_) => Err(StopError::NotFound),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let job_id = {
                let mut rx = self.rx.lock().await;
                match rx.recv().await {
                    Some(id) => id,
                    None => break,
                }
            };
            self.run_one(worker, job_id).await;
        }
    }

    async fn run_one(&self, worker: usize, job_id: String) {
        let Ok(Some(job)) = queries::get_job(&self.pool, &job_id).await else {
            warn!(job = %job_id, "queued job vanished");
            self.state.lock().unwrap().cancel_flags.remove(&job_id);
            return;
        };

        let flag = self
            .state
            .lock()
            .unwrap()
            .cancel_flags
            .get(&job_id)
            .cloned()
            .unwrap_or_default();

        if flag.is_cancelled() {
            // stopped while still queued; nothing ran, nothing to keep
            if queries::finish_job(&self.pool, &job_id, JobStatus::Failed, Some("cancelled before start"))
                .await
                .unwrap_or(false)
            {
                self.publisher.job_event(
                    ProgressEventKind::SyncFailed,
                    &job_id,
                    &job.account_id,
                    0,
                    0,
                    Some(JobStatus::Failed),
                    Some("cancelled before start"),
                );
            }
            self.release(&job);
            return;
        }

        let heartbeat = Heartbeat::new();
        self.state.lock().unwrap().heartbeats.insert(
            job_id.clone(),
            (job.account_id.clone(), heartbeat.clone()),
        );
        info!(worker, job = %job_id, account = %job.account_id, "job active");

        sync_service::run_sync_job(
            &self.pool,
            &self.publisher,
            self.factory.as_ref(),
            &self.config,
            &job_id,
            flag,
            heartbeat,
        )
        .await;

        self.release(&job);
    }

    fn release(&self, job: &SyncJob) {
        let mut state = self.state.lock().unwrap();
        state.busy_accounts.remove(&job.account_id);
        state.cancel_flags.remove(&job.id);
        state.heartbeats.remove(&job.id);
    }

    /// Scan heartbeats and fail jobs whose worker went quiet past the stall
    /// deadline. The account slot is freed so a fresh job can be submitted;
    /// the hung worker sees its cancel flag if it ever wakes up.
    async fn watchdog_loop(self: Arc<Self>) {
        let period = Duration::from_secs((self.config.stall_after.as_secs() / 2).max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let deadline = self.config.stall_after.as_secs() as i64;
            let stalled: Vec<(String, String)> = {
                let state = self.state.lock().unwrap();
                state
                    .heartbeats
                    .iter()
                    .filter(|(_, (_, hb))| hb.idle_secs() > deadline)
                    .map(|(job_id, (account_id, _))| (job_id.clone(), account_id.clone()))
                    .collect()
            };
            for (job_id, account_id) in stalled {
                warn!(job = %job_id, account = %account_id, "job stalled; marking failed");
                let detail = "stalled: worker heartbeat lost";
                let transitioned =
                    queries::finish_job(&self.pool, &job_id, JobStatus::Failed, Some(detail))
                        .await
                        .unwrap_or(false);
                if transitioned {
                    let _ = queries::update_account_status(
                        &self.pool,
                        &account_id,
                        ConnectionStatus::Error,
                        Some(detail),
                    )
                    .await;
                    self.publisher.job_event(
                        ProgressEventKind::SyncFailed,
                        &job_id,
                        &account_id,
                        0,
                        0,
                        Some(JobStatus::Failed),
                        Some(detail),
                    );
                }
                let mut state = self.state.lock().unwrap();
                if let Some(flag) = state.cancel_flags.get(&job_id) {
                    flag.cancel();
                }
                state.busy_accounts.remove(&account_id);
                state.heartbeats.remove(&job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_latches() {
        let flag = CancelFlag::default();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
        let clone = flag.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn fresh_heartbeat_is_not_idle() {
        let hb = Heartbeat::new();
        assert!(hb.idle_secs() <= 1);
        hb.beat();
        assert!(hb.idle_secs() <= 1);
    }
}
