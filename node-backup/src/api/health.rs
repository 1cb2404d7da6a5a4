//! Health check endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "agent_id": state.agent_id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs(),
        "active_operations": state.operations.running_count().await,
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "providers": crate::request::KNOWN_PROVIDERS,
    }))
}
