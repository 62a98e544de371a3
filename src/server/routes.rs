//! HTTP routes definition

use axum::{
    extract::Extension,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use super::{handlers, AppState};

/// Channel lease API
///
/// - POST /api/v1/channel/create  - Create (or renew) a lease
/// - POST /api/v1/channel/renew   - Renew an existing lease, 404 if none
/// - GET  /api/v1/channel/list    - List stored leases
pub fn channel_routes() -> Router {
    Router::new()
        .route("/api/v1/channel/create", post(handlers::create_channel))
        .route("/api/v1/channel/renew", post(handlers::renew_channel))
        .route("/api/v1/channel/list", get(handlers::list_channels))
}

/// Health check routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/_metrics", get(metrics_endpoint))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": crate::VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(Extension(state): Extension<Arc<AppState>>) -> String {
    state.coordinator.metrics().export()
}
