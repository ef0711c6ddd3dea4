//! End-to-end state machine scenarios: queue -> worker -> controller ->
//! persistence, with scripted mailbox sessions standing in for real servers.

mod common;

use std::time::Duration;

use common::*;
use mailsweep::db::queries;
use mailsweep::models::account::ConnectionStatus;
use mailsweep::models::job::JobStatus;
use mailsweep::services::job_queue::{StopError, SubmitError, SyncRequest};
use mailsweep::services::progress::ProgressEventKind;

fn request(account_id: &str) -> SyncRequest {
    SyncRequest {
        account_id: account_id.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn two_folders_no_overlap() {
    let mailbox = FakeMailbox::new(vec![
        fake_folder("INBOX", headers(&["a@x.com", "b@x.com", "c@x.com"])),
        fake_folder(
            "Sent",
            headers(&["d@x.com", "e@x.com", "f@x.com", "g@x.com", "h@x.com"]),
        ),
    ]);
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let job = queue.submit(request("acc_1")).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.error.is_none());
    assert_eq!(done.total_folders, 2);
    assert_eq!(done.processed_folders, 2);
    assert_eq!(done.current_count, 8);
    assert_eq!(done.result_count, 8);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());

    let addresses = queries::job_addresses(&pool, &job.id).await.unwrap();
    assert_eq!(addresses.len(), 8);

    let account = queries::get_account(&pool, "acc_1").await.unwrap().unwrap();
    assert_eq!(account.status, ConnectionStatus::Connected);
    assert!(account.last_sync_ts.is_some());
}

#[tokio::test]
async fn overlapping_addresses_dedupe_per_job() {
    let mailbox = FakeMailbox::new(vec![
        fake_folder("INBOX", headers(&["a@x.com", "b@x.com", "c@x.com"])),
        // two addresses repeat from folder 1
        fake_folder(
            "Sent",
            headers(&["d@x.com", "e@x.com", "f@x.com", "a@x.com", "b@x.com"]),
        ),
    ]);
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let job = queue.submit(request("acc_1")).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.current_count, 8);
    assert_eq!(done.result_count, 8);

    let addresses = queries::job_addresses(&pool, &job.id).await.unwrap();
    assert_eq!(addresses.len(), 6);
    // set semantics: no duplicates even across folders
    let mut deduped = addresses.clone();
    deduped.dedup();
    assert_eq!(deduped, addresses);
}

#[tokio::test]
async fn read_timeout_ends_as_partial_success() {
    let mut truncated = fake_folder(
        "Sent",
        headers(&["d@x.com", "e@x.com", "f@x.com", "g@x.com", "h@x.com"]),
    );
    truncated.timeout_after = Some(3);
    let mailbox = FakeMailbox::new(vec![
        fake_folder("INBOX", headers(&["a@x.com", "b@x.com", "c@x.com"])),
        truncated,
    ]);
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let job = queue.submit(request("acc_1")).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    // timeout is recoverable: the job keeps its partial results
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.processed_folders, 1);
    assert_eq!(done.total_folders, 2);
    assert_eq!(done.current_count, 6);
    let annotation = done.error.expect("partial annotation");
    assert!(annotation.contains("partial sync after"));

    // the six processed messages were all persisted
    assert_eq!(queries::count_job_addresses(&pool, &job.id).await.unwrap(), 6);
}

#[tokio::test]
async fn auth_failure_fails_job_and_flags_account() {
    let (pool, queue, _) = setup(FakeFactory::new(vec![Script::AuthFail])).await;
    seed_account(&pool, "acc_1").await;

    let job = queue.submit(request("acc_1")).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    assert_eq!(done.status, JobStatus::Failed);
    let detail = done.error.expect("failure detail");
    assert!(detail.starts_with("auth:"), "got {detail}");
    assert!(detail.contains("after"));

    let account = queries::get_account(&pool, "acc_1").await.unwrap().unwrap();
    assert_eq!(account.status, ConnectionStatus::Error);
    assert!(account.last_error.is_some());
}

#[tokio::test]
async fn midway_failure_keeps_flushed_addresses() {
    let mut broken = fake_folder("Sent", headers(&["d@x.com", "e@x.com"]));
    broken.fail_after = Some(0);
    let mailbox = FakeMailbox::new(vec![
        fake_folder("INBOX", headers(&["a@x.com", "b@x.com", "c@x.com"])),
        broken,
    ]);
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let job = queue.submit(request("acc_1")).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.unwrap().starts_with("protocol:"));
    // folder 1 finished before the failure; nothing it produced is dropped
    assert_eq!(queries::count_job_addresses(&pool, &job.id).await.unwrap(), 3);
    assert_eq!(done.processed_folders, 1);
}

#[tokio::test]
async fn second_submission_for_same_account_is_rejected() {
    let mailbox = FakeMailbox::new(vec![fake_folder(
        "INBOX",
        headers(&["a@x.com", "b@x.com", "c@x.com"]),
    )])
    .with_delay(Duration::from_millis(200));
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let first = queue.submit(request("acc_1")).await.unwrap();
    let second = queue.submit(request("acc_1")).await;
    assert!(matches!(second, Err(SubmitError::AccountBusy)));

    let done = wait_terminal(&pool, &first.id, Duration::from_secs(5)).await;
    assert_eq!(done.status, JobStatus::Completed);

    // slot freed shortly after the terminal state: a fresh job is admitted
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.submit(request("acc_1")).await.is_ok());
}

#[tokio::test]
async fn unknown_account_is_rejected() {
    let (_pool, queue, _) = setup(FakeFactory::new(vec![])).await;
    let result = queue.submit(request("acc_missing")).await;
    assert!(matches!(result, Err(SubmitError::AccountNotFound)));
}

#[tokio::test]
async fn cancellation_stops_mid_folder_and_freezes_counters() {
    let many: &[&str] = &[
        "m1@x.com", "m2@x.com", "m3@x.com", "m4@x.com", "m5@x.com", "m6@x.com", "m7@x.com",
        "m8@x.com", "m9@x.com", "m10@x.com", "m11@x.com", "m12@x.com",
    ];
    let mailbox = FakeMailbox::new(vec![fake_folder("INBOX", headers(many))])
        .with_delay(Duration::from_millis(50));
    let closed = mailbox.closed.clone();
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let job = queue.submit(request("acc_1")).await.unwrap();
    wait_progress(&pool, &job.id, 3, Duration::from_secs(5)).await;
    queue.stop(&job.id).await.unwrap();

    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.error.unwrap().contains("cancelled"));
    assert!(done.current_count < 12);
    assert!(closed.load(std::sync::atomic::Ordering::SeqCst));

    // no further increments after the terminal state
    let frozen = done.current_count;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = queries::get_job(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(after.current_count, frozen);
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn stop_unknown_job_is_not_found() {
    let (_pool, queue, _) = setup(FakeFactory::new(vec![])).await;
    assert!(matches!(
        queue.stop("no-such-job").await,
        Err(StopError::NotFound)
    ));
}

#[tokio::test]
async fn requested_folder_subset_is_honored() {
    let mailbox = FakeMailbox::new(vec![
        fake_folder("INBOX", headers(&["a@x.com", "b@x.com"])),
        fake_folder("Sent", headers(&["c@x.com"])),
        fake_folder("Spam", headers(&["d@x.com"])),
    ]);
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let mut req = request("acc_1");
    req.folders = vec!["inbox".into(), "SENT".into()];
    let job = queue.submit(req).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.total_folders, 2);
    assert_eq!(done.processed_folders, 2);
    assert_eq!(done.current_count, 3);
    assert_eq!(queries::count_job_addresses(&pool, &job.id).await.unwrap(), 3);
}

#[tokio::test]
async fn unreachable_proxy_fails_job_before_connecting() {
    let mailbox = FakeMailbox::new(vec![fake_folder("INBOX", headers(&["a@x.com"]))]);
    let (pool, queue, _) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;
    seed_proxy(&pool, "p1", "127.0.0.1", 1).await;

    let mut req = request("acc_1");
    req.proxy_id = Some("p1".into());
    let job = queue.submit(req).await.unwrap();
    let done = wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;

    assert_eq!(done.status, JobStatus::Failed);
    let detail = done.error.unwrap();
    assert!(detail.starts_with("proxy-unreachable:"), "got {detail}");
    assert_eq!(done.current_count, 0);
}

#[tokio::test]
async fn batch_run_aggregates_child_completion() {
    let session_a = FakeMailbox::new(vec![fake_folder("INBOX", headers(&["a@x.com"]))]);
    let session_b = FakeMailbox::new(vec![fake_folder("INBOX", headers(&["b@x.com"]))]);
    let factory = FakeFactory::new(vec![Script::Session(session_a), Script::Session(session_b)]);
    let (pool, queue, _) = setup(factory).await;
    seed_account(&pool, "acc_1").await;
    seed_account(&pool, "acc_2").await;

    let (parent, children) = queue
        .submit_batch(vec!["acc_1".into(), "acc_2".into()], vec![], None)
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(parent.children_total, 2);

    for child in &children {
        let done = wait_terminal(&pool, &child.id, Duration::from_secs(5)).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.parent_id.as_deref(), Some(parent.id.as_str()));
    }

    let parent_done = wait_terminal(&pool, &parent.id, Duration::from_secs(5)).await;
    assert_eq!(parent_done.status, JobStatus::Completed);
    assert_eq!(parent_done.children_done, 2);
}

#[tokio::test]
async fn events_are_ordered_per_job() {
    let mailbox = FakeMailbox::new(vec![
        fake_folder("INBOX", headers(&["a@x.com", "b@x.com", "c@x.com"])),
        fake_folder("Sent", headers(&["d@x.com", "e@x.com"])),
    ]);
    let (pool, queue, publisher) = setup(FakeFactory::single(mailbox)).await;
    seed_account(&pool, "acc_1").await;

    let mut rx = publisher.subscribe();
    let job = queue.submit(request("acc_1")).await.unwrap();
    wait_terminal(&pool, &job.id, Duration::from_secs(5)).await;
    // the terminal event is published just after the terminal row write
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut job_events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.sync_job_id.as_deref() == Some(job.id.as_str()) {
            job_events.push(event);
        }
    }

    assert_eq!(job_events.first().unwrap().kind, ProgressEventKind::SyncStarted);
    assert_eq!(
        job_events.last().unwrap().kind,
        ProgressEventKind::SyncCompleted
    );
    // monotonic processed counts, in observation order
    let processed: Vec<i64> = job_events
        .iter()
        .filter(|e| e.kind == ProgressEventKind::SyncProgress)
        .map(|e| e.processed)
        .collect();
    assert!(processed.windows(2).all(|w| w[0] <= w[1]), "{processed:?}");
}
