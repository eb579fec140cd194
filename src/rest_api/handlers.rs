//! Request handlers for the REST API

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

/// State shared with the handlers
#[derive(Clone, Debug)]
pub struct ApiState {
    pub is_leader: Arc<AtomicBool>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica currently holds the leader lease
    pub leader: bool,
}

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

/// Metrics endpoint handler
pub async fn metrics() -> Result<String, (StatusCode, String)> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(buffer)
}
