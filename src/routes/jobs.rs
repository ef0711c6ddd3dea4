use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::db::queries;
use crate::models::job::SyncJob;

/// GET /jobs/:job_id - poll a job's state and counters
pub async fn get_job(
    State(pool): State<SqlitePool>,
    Path(job_id): Path<String>,
) -> Result<Json<SyncJob>, (StatusCode, String)> {
    let job = queries::get_job(&pool, &job_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "job not found".to_string()))?;
    Ok(Json(job))
}

/// GET /jobs/:job_id/addresses - the extracted-address set for export
pub async fn job_addresses(
    State(pool): State<SqlitePool>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    queries::get_job(&pool, &job_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "job not found".to_string()))?;

    let addresses = queries::job_addresses(&pool, &job_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "jobId": job_id,
        "count": addresses.len(),
        "addresses": addresses,
    })))
}
