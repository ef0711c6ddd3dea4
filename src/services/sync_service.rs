//! Sync job controller: drives one account's synchronization run through the
//! pending -> running -> {completed, failed} state machine, with incremental
//! flushes so completed work survives partial failure.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::db::queries;
use crate::extract;
use crate::mailbox::{Folder, MailError, MailboxSession, SessionFactory};
use crate::models::account::{Account, ConnectionStatus};
use crate::models::job::{JobStatus, SyncJob};
use crate::net::Dialer;
use crate::services::job_queue::{CancelFlag, Heartbeat};
use crate::services::progress::{ProgressEventKind, ProgressPublisher};

/// Why a run stopped before finishing every folder.
pub(crate) enum SyncAbort {
    Cancelled,
    Mail(MailError),
    Internal(anyhow::Error),
}

impl From<MailError> for SyncAbort {
    fn from(e: MailError) -> Self {
        SyncAbort::Mail(e)
    }
}

/// Terminal classification of a finished run.
#[derive(Debug, PartialEq)]
pub(crate) enum Terminal {
    Completed { annotation: Option<String> },
    Failed { detail: String },
}

/// Pure decision: (outcome, timeout policy, elapsed) -> terminal state.
/// Timeouts and cancellations close as partial successes; everything else
/// that aborted the run fails the job.
pub(crate) fn classify(
    outcome: Result<(), SyncAbort>,
    timeout_partial: bool,
    elapsed: Duration,
) -> Terminal {
    match outcome {
        Ok(()) => Terminal::Completed { annotation: None },
        Err(SyncAbort::Cancelled) => Terminal::Completed {
            annotation: Some(format!("sync cancelled after {}s", elapsed.as_secs())),
        },
        Err(SyncAbort::Mail(e)) if e.is_timeout() && timeout_partial => Terminal::Completed {
            annotation: Some(format!(
                "partial sync after {}s: {}",
                elapsed.as_secs(),
                e
            )),
        },
        Err(SyncAbort::Mail(e)) => Terminal::Failed {
            detail: format!("{}: {} (after {}s)", e.kind(), e, elapsed.as_secs()),
        },
        Err(SyncAbort::Internal(e)) => Terminal::Failed {
            detail: format!("internal: {} (after {}s)", e, elapsed.as_secs()),
        },
    }
}

#[derive(Default)]
struct Progress {
    current_count: i64,
    result_count: i64,
    processed_folders: i64,
    total_folders: i64,
    total_messages: i64,
    seen: HashSet<String>,
    pending: Vec<(String, String)>,
    since_flush: u32,
}

/// Run one sync job to a terminal state. Infrastructure errors (storage) are
/// logged; the job row is the source of truth for the outcome.
pub async fn run_sync_job(
    pool: &SqlitePool,
    publisher: &ProgressPublisher,
    factory: &dyn SessionFactory,
    config: &SyncConfig,
    job_id: &str,
    cancel: CancelFlag,
    heartbeat: Heartbeat,
) {
    if let Err(e) = run_inner(pool, publisher, factory, config, job_id, cancel, heartbeat).await {
        warn!(job = %job_id, error = %e, "sync job bookkeeping error");
    }
}

async fn run_inner(
    pool: &SqlitePool,
    publisher: &ProgressPublisher,
    factory: &dyn SessionFactory,
    config: &SyncConfig,
    job_id: &str,
    cancel: CancelFlag,
    heartbeat: Heartbeat,
) -> anyhow::Result<()> {
    let Some(job) = queries::get_job(pool, job_id).await? else {
        anyhow::bail!("job {job_id} does not exist");
    };
    if !queries::claim_job(pool, job_id).await? {
        warn!(job = %job_id, "job not claimable; already started or finalized");
        return Ok(());
    }
    let started = Instant::now();

    let Some(account) = queries::get_account(pool, &job.account_id).await? else {
        let detail = format!("internal: account {} not found (after 0s)", job.account_id);
        if queries::finish_job(pool, job_id, JobStatus::Failed, Some(&detail)).await? {
            publisher.job_event(
                ProgressEventKind::SyncFailed,
                job_id,
                &job.account_id,
                0,
                0,
                Some(JobStatus::Failed),
                Some(&detail),
            );
        }
        return Ok(());
    };

    // Undecodable credentials mark the account invalid, not errored: the
    // record needs re-provisioning, not a retry.
    let account = match account.with_credentials() {
        Ok(a) => a,
        Err(e) => {
            let detail = format!("auth: stored credentials are invalid: {e} (after 0s)");
            queries::update_account_status(
                pool,
                &job.account_id,
                ConnectionStatus::Invalid,
                Some("stored credentials are invalid"),
            )
            .await?;
            if queries::finish_job(pool, job_id, JobStatus::Failed, Some(&detail)).await? {
                publisher.job_event(
                    ProgressEventKind::SyncFailed,
                    job_id,
                    &job.account_id,
                    0,
                    0,
                    Some(JobStatus::Failed),
                    Some(&detail),
                );
                publisher.account_status(
                    &job.account_id,
                    ConnectionStatus::Invalid,
                    None,
                    Some("stored credentials are invalid"),
                );
            }
            return Ok(());
        }
    };

    info!(job = %job.id, account = %account.id, email = %account.email, "sync started");
    queries::update_account_status(pool, &account.id, ConnectionStatus::Syncing, None).await?;
    publisher.job_event(
        ProgressEventKind::SyncStarted,
        &job.id,
        &account.id,
        0,
        0,
        Some(JobStatus::Running),
        None,
    );
    publisher.account_status(&account.id, ConnectionStatus::Syncing, None, None);

    let mut progress = Progress::default();
    let outcome = execute(
        pool, publisher, factory, config, &job, &account, &mut progress, &cancel, &heartbeat,
    )
    .await;

    // Flush whatever is still buffered, on every path: addresses extracted
    // before a failure are part of the result.
    if let Err(e) = flush(pool, publisher, &job, &account, &mut progress, &heartbeat).await {
        warn!(job = %job.id, error = %e, "final flush failed");
    }

    let timeout_partial = config.is_timeout_partial(account.protocol);
    let terminal = classify(outcome, timeout_partial, started.elapsed());
    finalize(pool, publisher, &job, &account, &progress, terminal).await
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    pool: &SqlitePool,
    publisher: &ProgressPublisher,
    factory: &dyn SessionFactory,
    config: &SyncConfig,
    job: &SyncJob,
    account: &Account,
    progress: &mut Progress,
    cancel: &CancelFlag,
    heartbeat: &Heartbeat,
) -> Result<(), SyncAbort> {
    let dialer = resolve_dialer(pool, config, job, account).await?;
    let credentials = account
        .credentials
        .as_ref()
        .ok_or_else(|| MailError::Auth("account has no credentials".into()))?;

    let mut session = factory.open(account, credentials, &dialer).await?;
    let result = walk_folders(
        pool,
        publisher,
        config,
        job,
        account,
        session.as_mut(),
        progress,
        cancel,
        heartbeat,
    )
    .await;
    // released on every exit path, success or not
    if let Err(e) = session.close().await {
        warn!(job = %job.id, error = %e, "session close failed");
    }
    result
}

/// A job-supplied proxy always overrides the account's stored proxy.
async fn resolve_dialer(
    pool: &SqlitePool,
    config: &SyncConfig,
    job: &SyncJob,
    account: &Account,
) -> Result<Dialer, SyncAbort> {
    let proxy_id = job.proxy_id.as_ref().or(account.proxy_id.as_ref());
    let Some(proxy_id) = proxy_id else {
        return Ok(Dialer::direct());
    };
    let proxy = queries::get_proxy(pool, proxy_id)
        .await
        .map_err(SyncAbort::Internal)?
        .ok_or_else(|| MailError::ProxyConfig(format!("proxy {proxy_id} not found")))?;
    let dialer = Dialer::via(proxy)?;
    dialer.probe(config.proxy_probe_timeout).await?;
    Ok(dialer)
}

/// Match an explicit folder request against the adapter listing
/// (case-insensitive on name or path); empty request means everything.
fn select_folders(requested: &[String], listing: Vec<Folder>) -> Result<Vec<Folder>, MailError> {
    if requested.is_empty() {
        return Ok(listing);
    }
    let selected: Vec<Folder> = listing
        .into_iter()
        .filter(|f| {
            requested
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&f.name) || r.eq_ignore_ascii_case(&f.path))
        })
        .collect();
    if selected.is_empty() {
        return Err(MailError::Protocol(format!(
            "none of the requested folders exist: {}",
            requested.join(", ")
        )));
    }
    Ok(selected)
}

#[allow(clippy::too_many_arguments)]
async fn walk_folders(
    pool: &SqlitePool,
    publisher: &ProgressPublisher,
    config: &SyncConfig,
    job: &SyncJob,
    account: &Account,
    session: &mut dyn MailboxSession,
    progress: &mut Progress,
    cancel: &CancelFlag,
    heartbeat: &Heartbeat,
) -> Result<(), SyncAbort> {
    let listing = session.list_folders().await?;
    let folders = select_folders(&job.folders, listing)?;
    progress.total_folders = folders.len() as i64;
    flush(pool, publisher, job, account, progress, heartbeat)
        .await
        .map_err(SyncAbort::Internal)?;

    for folder in &folders {
        if cancel.is_cancelled() {
            return Err(SyncAbort::Cancelled);
        }
        let total = session.open_folder(folder).await?;
        progress.total_messages += total as i64;
        publisher.job_event(
            ProgressEventKind::SyncMessageCount,
            &job.id,
            &account.id,
            progress.current_count,
            progress.total_messages,
            None,
            None,
        );

        let mut offset: u32 = 0;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(SyncAbort::Cancelled);
            }
            let limit = config.fetch_batch.min(total - offset);
            let batch = match timeout(
                config.fetch_timeout,
                session.fetch_headers(folder, offset, limit),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(MailError::Timeout(config.fetch_timeout).into()),
            };
            if batch.is_empty() {
                // folder shrank under us; move on rather than spin
                break;
            }

            for header in &batch {
                let addresses = extract::extract_addresses(header);
                progress.current_count += 1;
                progress.result_count += addresses.len() as i64;
                for address in addresses {
                    if progress.seen.insert(address.clone()) {
                        progress.pending.push((address, folder.name.clone()));
                    }
                }
                progress.since_flush += 1;
                if progress.since_flush >= config.flush_every {
                    flush(pool, publisher, job, account, progress, heartbeat)
                        .await
                        .map_err(SyncAbort::Internal)?;
                }
            }
            offset += batch.len() as u32;
        }

        progress.processed_folders += 1;
        flush(pool, publisher, job, account, progress, heartbeat)
            .await
            .map_err(SyncAbort::Internal)?;
    }
    Ok(())
}

/// Persist buffered addresses + counters, bump the heartbeat, publish a
/// progress delta. Bounded write amplification: called per `flush_every`
/// messages and at folder boundaries, not per message.
async fn flush(
    pool: &SqlitePool,
    publisher: &ProgressPublisher,
    job: &SyncJob,
    account: &Account,
    progress: &mut Progress,
    heartbeat: &Heartbeat,
) -> anyhow::Result<()> {
    if !progress.pending.is_empty() {
        queries::append_addresses(pool, &job.id, &progress.pending).await?;
        progress.pending.clear();
    }
    queries::update_job_progress(
        pool,
        &job.id,
        progress.current_count,
        progress.result_count,
        progress.processed_folders,
        progress.total_folders,
    )
    .await?;
    heartbeat.beat();
    publisher.job_event(
        ProgressEventKind::SyncProgress,
        &job.id,
        &account.id,
        progress.current_count,
        progress.total_messages,
        Some(JobStatus::Running),
        None,
    );
    progress.since_flush = 0;
    Ok(())
}

async fn finalize(
    pool: &SqlitePool,
    publisher: &ProgressPublisher,
    job: &SyncJob,
    account: &Account,
    progress: &Progress,
    terminal: Terminal,
) -> anyhow::Result<()> {
    match terminal {
        Terminal::Completed { annotation } => {
            if !queries::finish_job(
                pool,
                &job.id,
                JobStatus::Completed,
                annotation.as_deref(),
            )
            .await?
            {
                warn!(job = %job.id, "job already finalized elsewhere");
                return Ok(());
            }
            queries::update_account_status(pool, &account.id, ConnectionStatus::Connected, None)
                .await?;
            queries::touch_account_last_sync(pool, &account.id).await?;
            info!(
                job = %job.id,
                account = %account.id,
                messages = progress.current_count,
                addresses = progress.seen.len(),
                "sync completed"
            );
            publisher.job_event(
                ProgressEventKind::SyncCompleted,
                &job.id,
                &account.id,
                progress.current_count,
                progress.total_messages,
                Some(JobStatus::Completed),
                annotation.as_deref(),
            );
            publisher.account_status(
                &account.id,
                ConnectionStatus::Connected,
                Some(crate::db::now_epoch()),
                None,
            );
        }
        Terminal::Failed { detail } => {
            if !queries::finish_job(pool, &job.id, JobStatus::Failed, Some(&detail)).await? {
                warn!(job = %job.id, "job already finalized elsewhere");
                return Ok(());
            }
            queries::update_account_status(
                pool,
                &account.id,
                ConnectionStatus::Error,
                Some(&detail),
            )
            .await?;
            warn!(job = %job.id, account = %account.id, error = %detail, "sync failed");
            publisher.job_event(
                ProgressEventKind::SyncFailed,
                &job.id,
                &account.id,
                progress.current_count,
                progress.total_messages,
                Some(JobStatus::Failed),
                Some(&detail),
            );
            publisher.account_status(
                &account.id,
                ConnectionStatus::Error,
                None,
                Some(&detail),
            );
        }
    }
    Ok(())
}
