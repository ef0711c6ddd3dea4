use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::services::job_queue::{JobQueue, StopError, SubmitError, SyncRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncRequest {
    pub account_id: String,
    #[serde(default)]
    pub folders: Vec<String>,
    pub proxy_id: Option<String>,
    pub name: Option<String>,
}

fn submit_error(e: SubmitError) -> (StatusCode, String) {
    match e {
        SubmitError::AccountNotFound => (StatusCode::NOT_FOUND, "account not found".into()),
        SubmitError::AccountBusy => (
            StatusCode::CONFLICT,
            "a sync job for this account is already queued or running".into(),
        ),
        SubmitError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg),
        SubmitError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /sync/start - validate, enqueue, return the job id immediately
pub async fn start_sync(
    State(queue): State<Arc<JobQueue>>,
    Json(request): Json<StartSyncRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let job = queue
        .submit(SyncRequest {
            account_id: request.account_id,
            folders: request.folders,
            proxy_id: request.proxy_id,
            name: request.name,
            parent_id: None,
        })
        .await
        .map_err(submit_error)?;

    Ok(Json(json!({
        "jobId": job.id,
        "accountId": job.account_id,
        "status": job.status,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBatchRequest {
    pub account_ids: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    pub name: Option<String>,
}

/// POST /sync/batch - one parent job plus a child job per account
pub async fn start_batch(
    State(queue): State<Arc<JobQueue>>,
    Json(request): Json<StartBatchRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let (parent, children) = queue
        .submit_batch(request.account_ids, request.folders, request.name)
        .await
        .map_err(submit_error)?;

    Ok(Json(json!({
        "parentJobId": parent.id,
        "childJobIds": children.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        "childrenTotal": parent.children_total,
    })))
}

/// POST /sync/stop/:job_id - set the cooperative cancellation flag
pub async fn stop_sync(
    State(queue): State<Arc<JobQueue>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    queue.stop(&job_id).await.map_err(|e| match e {
        StopError::NotFound => (StatusCode::NOT_FOUND, "job not found".into()),
        StopError::AlreadyTerminal => (
            StatusCode::CONFLICT,
            "job already reached a terminal state".into(),
        ),
        StopError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    })?;

    Ok(Json(json!({ "jobId": job_id, "stopping": true })))
}
