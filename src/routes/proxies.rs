use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::db::queries;
use crate::mailbox::MailError;
use crate::models::proxy::{Proxy, ProxyProtocol};
use crate::net::Dialer;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Either a stored proxy by id, or an inline definition.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestProxyRequest {
    pub proxy_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// POST /proxies/test - resolve and probe a proxy within a bounded timeout
pub async fn test_proxy(
    State(pool): State<SqlitePool>,
    Json(request): Json<TestProxyRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let proxy = match &request.proxy_id {
        Some(proxy_id) => queries::get_proxy(&pool, proxy_id)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .ok_or_else(|| (StatusCode::NOT_FOUND, "proxy not found".to_string()))?,
        None => inline_proxy(&request)?,
    };

    let dialer = Dialer::via(proxy).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    match dialer.probe(PROBE_TIMEOUT).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e @ MailError::ProxyUnreachable(_)) => {
            Ok(Json(json!({ "ok": false, "error": e.to_string() })))
        }
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

fn inline_proxy(request: &TestProxyRequest) -> Result<Proxy, (StatusCode, String)> {
    let host = request
        .host
        .clone()
        .ok_or((StatusCode::BAD_REQUEST, "host is required".to_string()))?;
    let port = request
        .port
        .ok_or((StatusCode::BAD_REQUEST, "port is required".to_string()))?;
    let protocol = request
        .protocol
        .as_deref()
        .map(|p| {
            ProxyProtocol::from_str(p).ok_or((
                StatusCode::BAD_REQUEST,
                format!("unknown proxy protocol {p}"),
            ))
        })
        .transpose()?
        .unwrap_or(ProxyProtocol::Socks5);

    Ok(Proxy {
        id: String::new(),
        host,
        port,
        protocol,
        username: request.username.clone(),
        password: request.password.clone(),
    })
}
