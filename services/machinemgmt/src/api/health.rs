//! Health check endpoints.
//!
//! Probed by the orchestrator: startup once the listener is up, liveness
//! while the process runs, readiness until shutdown begins.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status: "ok" or "draining".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Buffers currently lent out to requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outstanding_buffers: Option<u64>,
}

impl HealthResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            service: "machinemgmt".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            outstanding_buffers: None,
        }
    }
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/startup", get(startup))
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
}

async fn startup() -> impl IntoResponse {
    Json(HealthResponse::new("ok"))
}

async fn liveness() -> impl IntoResponse {
    Json(HealthResponse::new("ok"))
}

/// Returns 503 once shutdown has begun so no new traffic is routed here.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let mut response = if state.is_draining() {
        HealthResponse::new("draining")
    } else {
        HealthResponse::new("ok")
    };
    response.outstanding_buffers = Some(state.images().pool().stats().outstanding);

    if state.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    } else {
        (StatusCode::OK, Json(response))
    }
}
