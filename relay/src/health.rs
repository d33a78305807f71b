//! Health, readiness and metrics endpoints.

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::app::AppState;

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `GET /health`: the process is up.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": timestamp() }))
}

/// `GET /ready`: the bus session is established.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.bus.is_connected() {
        (StatusCode::OK, Json(json!({ "status": "ready", "timestamp": timestamp() })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "timestamp": timestamp() })),
        )
    }
}

/// `GET /metrics`: Prometheus text format.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
