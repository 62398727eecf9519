//! Central HTTP API: heartbeat sink, fleet queries, device proxies, and
//! deployment management.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mctl_core::auth::{bearer_token, token_matches};
use mctl_core::models::{DeploymentRequest, HeartbeatPayload};

use crate::deployer::{DeployError, Deployer};
use crate::fleet_client::{FleetClient, FleetClientError};
use crate::fleet_store::{FleetStore, FleetStoreError};

/// Errors surfaced by the central API; every body is `{ "detail": … }`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, detail),
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Self::Conflict(detail) => (StatusCode::CONFLICT, detail),
            Self::BadGateway(detail) => (StatusCode::BAD_GATEWAY, detail),
            Self::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<FleetStoreError> for ApiError {
    fn from(e: FleetStoreError) -> Self {
        warn!(error = %e, "fleet store error");
        Self::Internal("fleet store error".to_string())
    }
}

impl From<FleetClientError> for ApiError {
    fn from(e: FleetClientError) -> Self {
        Self::BadGateway(e.to_string())
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::NoTargets | DeployError::InvalidBatchSize => {
                Self::BadRequest(e.to_string())
            }
            DeployError::NotFound(_) => Self::NotFound(e.to_string()),
            DeployError::NotCancellable { .. } => Self::Conflict(e.to_string()),
            DeployError::Store(inner) => inner.into(),
        }
    }
}

#[derive(Clone)]
pub struct CentralApiState {
    pub store: Arc<FleetStore>,
    pub fleet: Arc<FleetClient>,
    pub deployer: Arc<Deployer>,
    pub api_token: Option<Arc<String>>,
}

async fn auth_middleware(
    State(state): State<CentralApiState>,
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
        _ => ApiError::Unauthorized("invalid or missing bearer token".to_string())
            .into_response(),
    }
}

pub fn router(state: CentralApiState) -> Router {
    Router::new()
        .route("/api/heartbeat", post(receive_heartbeat))
        .route("/api/fleet/clients", get(list_clients))
        .route("/api/fleet/clients/:name", get(get_client))
        .route("/api/fleet/clients/:name/workloads", get(client_workloads))
        .route(
            "/api/fleet/clients/:name/workloads/:workload",
            get(client_workload),
        )
        .route(
            "/api/fleet/clients/:name/workloads/:workload/start",
            post(proxy_start),
        )
        .route(
            "/api/fleet/clients/:name/workloads/:workload/stop",
            post(proxy_stop),
        )
        .route(
            "/api/fleet/clients/:name/workloads/:workload/restart",
            post(proxy_restart),
        )
        .route(
            "/api/fleet/clients/:name/workloads/:workload/logs",
            get(proxy_logs),
        )
        .route("/api/fleet/clients/:name/reload", post(proxy_reload))
        .route(
            "/api/fleet/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route("/api/fleet/deployments/:id", get(get_deployment))
        .route("/api/fleet/deployments/:id/cancel", post(cancel_deployment))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Serves the central API until cancelled.
pub async fn serve(
    addr: String,
    state: CentralApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "central api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- heartbeat ---

async fn receive_heartbeat(
    State(state): State<CentralApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .upsert_heartbeat(&payload, &peer.ip().to_string())?;
    Ok(Json(json!({ "status": "ok" })))
}

// --- fleet queries ---

async fn list_clients(
    State(state): State<CentralApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let clients = state.store.list_clients()?;
    Ok(Json(serde_json::to_value(clients).unwrap_or_default()))
}

async fn get_client(
    State(state): State<CentralApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let client = state
        .store
        .get_client(&name)?
        .ok_or_else(|| ApiError::NotFound(format!("Client not found: {name}")))?;
    Ok(Json(serde_json::to_value(client).unwrap_or_default()))
}

async fn client_workloads(
    State(state): State<CentralApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.store.get_client(&name)?.is_none() {
        return Err(ApiError::NotFound(format!("Client not found: {name}")));
    }
    let workloads = state.store.client_workloads(&name)?;
    Ok(Json(serde_json::to_value(workloads).unwrap_or_default()))
}

async fn client_workload(
    State(state): State<CentralApiState>,
    Path((name, workload)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.store.client_workload(&name, &workload)?.ok_or_else(|| {
        ApiError::NotFound(format!("Workload '{workload}' not found on client '{name}'"))
    })?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

// --- proxies ---

fn resolve_endpoint(
    state: &CentralApiState,
    name: &str,
) -> Result<(String, u16), ApiError> {
    state
        .store
        .resolve_endpoint(name)?
        .ok_or_else(|| ApiError::NotFound(format!("Client not found: {name}")))
}

async fn proxy_start(
    State(state): State<CentralApiState>,
    Path((name, workload)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (host, port) = resolve_endpoint(&state, &name)?;
    let response = state.fleet.start_workload(&host, port, &workload).await?;
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

async fn proxy_stop(
    State(state): State<CentralApiState>,
    Path((name, workload)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (host, port) = resolve_endpoint(&state, &name)?;
    let response = state.fleet.stop_workload(&host, port, &workload).await?;
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

async fn proxy_restart(
    State(state): State<CentralApiState>,
    Path((name, workload)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (host, port) = resolve_endpoint(&state, &name)?;
    let response = state.fleet.restart_workload(&host, port, &workload).await?;
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn proxy_logs(
    State(state): State<CentralApiState>,
    Path((name, workload)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (host, port) = resolve_endpoint(&state, &name)?;
    let lines = query.lines.unwrap_or(50);
    let body = state.fleet.logs(&host, port, &workload, lines).await?;
    Ok(Json(body))
}

async fn proxy_reload(
    State(state): State<CentralApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (host, port) = resolve_endpoint(&state, &name)?;
    let body = state.fleet.reload(&host, port).await?;
    Ok(Json(body))
}

// --- deployments ---

async fn create_deployment(
    State(state): State<CentralApiState>,
    Json(request): Json<DeploymentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.deployer.start(request).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct DeploymentsQuery {
    limit: Option<usize>,
}

async fn list_deployments(
    State(state): State<CentralApiState>,
    Query(query): Query<DeploymentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let records = state.store.list_deployments(limit)?;
    Ok(Json(serde_json::to_value(records).unwrap_or_default()))
}

async fn get_deployment(
    State(state): State<CentralApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .store
        .get_deployment(&id)?
        .ok_or_else(|| ApiError::NotFound("Deployment not found".to_string()))?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

async fn cancel_deployment(
    State(state): State<CentralApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.deployer.cancel(&id)?;
    Ok(Json(
        json!({ "success": true, "message": "Deployment cancelled" }),
    ))
}
