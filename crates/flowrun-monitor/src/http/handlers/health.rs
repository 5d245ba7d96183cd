//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::poller::MonitorHealth;
use crate::state::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let views = state.views().await;
    let running = views.iter().filter(|v| !v.finished).count();
    let degraded = views
        .iter()
        .filter(|v| !v.finished && matches!(v.health, MonitorHealth::Degraded { .. }))
        .count();

    Json(serde_json::json!({
        "status": "ok",
        "monitors": running,
        "degraded": degraded,
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&state).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
