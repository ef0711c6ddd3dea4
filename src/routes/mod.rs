use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;

use crate::services::job_queue::JobQueue;
use crate::services::progress::ProgressPublisher;

pub mod events;
pub mod jobs;
pub mod proxies;
pub mod sync;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub queue: Arc<JobQueue>,
    pub publisher: ProgressPublisher,
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<JobQueue> {
    fn from_ref(state: &AppState) -> Self {
        state.queue.clone()
    }
}

impl FromRef<AppState> for ProgressPublisher {
    fn from_ref(state: &AppState) -> Self {
        state.publisher.clone()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/start", post(sync::start_sync))
        .route("/sync/batch", post(sync::start_batch))
        .route("/sync/stop/:job_id", post(sync::stop_sync))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/addresses", get(jobs::job_addresses))
        .route("/proxies/test", post(proxies::test_proxy))
        .route("/events", get(events::events_stream))
}
