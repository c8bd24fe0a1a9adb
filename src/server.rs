use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde_json::{json, Value};

use crate::grid::{EngineHandle, EngineStatus, GridEngine, GridError, GridResult, ReconcileReport, TradingMode};

/// Shared state behind every route
#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<GridEngine>,
    pub handle: EngineHandle,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, err: &GridError) -> ApiError {
    (status, Json(json!({ "error": err.to_string() })))
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/health", get(health_handler))
        .route("/api/reconcile", post(reconcile_handler))
        .route("/api/mode/:mode", post(mode_handler))
        .with_state(state)
}

/// Serve the status API until the listener fails
pub async fn start_server(state: ServerState, host: &str, port: u16) -> GridResult<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| GridError::InvalidConfig(format!("invalid server address {}:{}: {}", host, port, e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server running on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn status_handler(State(state): State<ServerState>) -> Result<Json<EngineStatus>, ApiError> {
    state
        .engine
        .status()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, &e))
}

/// Stale when no reconciliation completed within three intervals
async fn health_handler(State(state): State<ServerState>) -> (StatusCode, Json<Value>) {
    let limit = state.engine.settings().reconciliation_interval_secs.max(1) as i64 * 3;
    let since = state.engine.seconds_since_tick().await;
    let healthy = since.map_or(true, |s| s <= limit);
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "stale" },
            "mode": state.engine.mode(),
            "seconds_since_tick": since,
        })),
    )
}

async fn reconcile_handler(State(state): State<ServerState>) -> Result<Json<Vec<ReconcileReport>>, ApiError> {
    state
        .handle
        .force_reconcile()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, &e))
}

async fn mode_handler(State(state): State<ServerState>, Path(mode): Path<String>) -> Result<Json<Value>, ApiError> {
    let mode: TradingMode = mode.parse().map_err(|e| api_error(StatusCode::BAD_REQUEST, &e))?;
    let report = state
        .handle
        .switch_mode(mode)
        .await
        .map_err(|e| api_error(StatusCode::CONFLICT, &e))?;
    Ok(Json(json!(report)))
}
