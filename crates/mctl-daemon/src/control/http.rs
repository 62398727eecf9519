//! Device HTTP API: mirrors the local control surface over the network.
//!
//! Bearer-token auth runs as router middleware; the comparison is digest
//! based so it does not exit early on the token text.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mctl_core::auth::{bearer_token, token_matches};

use crate::control::{workload_detail, MAX_LOG_LINES};
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
struct DeviceApiState {
    orchestrator: Arc<Orchestrator>,
    api_token: Option<Arc<String>>,
}

fn detail_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

async fn auth_middleware(
    State(state): State<DeviceApiState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    match presented {
        Some(token) if token_matches(expected, token) => next.run(request).await,
        _ => detail_error(StatusCode::UNAUTHORIZED, "invalid or missing bearer token"),
    }
}

pub fn router(orchestrator: Arc<Orchestrator>, api_token: Option<String>) -> Router {
    let state = DeviceApiState {
        orchestrator,
        api_token: api_token.map(Arc::new),
    };
    Router::new()
        .route("/api/health", get(health))
        .route("/api/list", get(list))
        .route("/api/status/:name", get(status))
        .route("/api/start/:name", post(start))
        .route("/api/stop/:name", post(stop))
        .route("/api/restart/:name", post(restart))
        .route("/api/reload", post(reload))
        .route("/api/logs/:name", get(logs))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Serves the device API until cancelled.
pub async fn serve(
    addr: String,
    orchestrator: Arc<Orchestrator>,
    api_token: Option<String>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(orchestrator, api_token);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "device http api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn list(State(state): State<DeviceApiState>) -> Json<serde_json::Value> {
    Json(json!({ "workloads": state.orchestrator.list_infos() }))
}

async fn status(State(state): State<DeviceApiState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.workload(&name) {
        None => detail_error(StatusCode::NOT_FOUND, format!("Unknown workload: {name}")),
        Some((spec, workload_state)) => {
            Json(workload_detail(&spec, &workload_state)).into_response()
        }
    }
}

async fn start(State(state): State<DeviceApiState>, Path(name): Path<String>) -> Response {
    Json(state.orchestrator.start_workload(&name).await).into_response()
}

async fn stop(State(state): State<DeviceApiState>, Path(name): Path<String>) -> Response {
    Json(state.orchestrator.stop_workload(&name).await).into_response()
}

async fn restart(State(state): State<DeviceApiState>, Path(name): Path<String>) -> Response {
    Json(state.orchestrator.restart_workload(&name).await).into_response()
}

async fn reload(State(state): State<DeviceApiState>) -> Response {
    match state.orchestrator.reload().await {
        Ok(report) => Json(json!({ "success": true, "changes": report })).into_response(),
        Err(e) => detail_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn logs(
    State(state): State<DeviceApiState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let lines = query.lines.unwrap_or(50);
    if lines == 0 || lines > MAX_LOG_LINES {
        return detail_error(
            StatusCode::BAD_REQUEST,
            format!("'lines' must be between 1 and {MAX_LOG_LINES}"),
        );
    }
    match state.orchestrator.read_logs(&name, lines) {
        None => detail_error(StatusCode::NOT_FOUND, format!("Unknown workload: {name}")),
        Some(lines) => Json(json!({ "name": name, "lines": lines })).into_response(),
    }
}
