//! HTTP API handlers and routing.

mod bootstrap;
pub mod error;
mod health;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::routes())
        .nest("/bootstrap", bootstrap::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
