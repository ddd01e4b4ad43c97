//! Health check, status and metrics endpoints
//!
//! Provides simple health check for monitoring probes, plus a JSON view of
//! live listeners and inbound traffic for operators.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use relaycast_cluster::LifecycleState;
use relaycast_core::metrics::gather_metrics;

use crate::http::{AppError, AppResult, AppState};

/// Health and metrics router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
}

/// `OK` while the relay is running, 503 with the lifecycle state otherwise
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let lifecycle = *state.lifecycle.borrow();
    match lifecycle {
        LifecycleState::Running => (StatusCode::OK, "OK".to_string()),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: String,
    pub listeners: Vec<ListenerStatus>,
    pub inbound: InboundStatus,
}

#[derive(Debug, Serialize)]
pub struct ListenerStatus {
    pub connection_id: String,
    pub connected_secs: u64,
    pub forwarded: u64,
}

#[derive(Debug, Serialize)]
pub struct InboundStatus {
    pub received: u64,
    pub errors: u64,
}

/// Lifecycle state, live listeners and inbound subscriber counters
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let lifecycle = *state.lifecycle.borrow();
    let listeners = state
        .fanout
        .listeners()
        .into_iter()
        .map(|listener| ListenerStatus {
            connection_id: listener.connection_id,
            connected_secs: listener.connected_for.as_secs(),
            forwarded: listener.forwarded,
        })
        .collect();

    Json(StatusResponse {
        state: lifecycle.to_string(),
        listeners,
        inbound: InboundStatus {
            received: state.inbound.received(),
            errors: state.inbound.errors(),
        },
    })
}

/// Prometheus text exposition
pub async fn metrics_handler() -> AppResult<String> {
    gather_metrics().map_err(|e| {
        tracing::error!("Failed to gather metrics: {}", e);
        AppError::internal_server_error("Failed to gather metrics")
    })
}
