//! HTTP API of the agent.

pub mod health;
pub mod operations;

use crate::operations::{Engine, OperationsService};
use crate::ws::WsState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent_id: String,
    pub operations: OperationsService,
}

/// Create shared application state around `engine`
pub fn create_app_state(agent_id: impl Into<String>, engine: Engine) -> AppState {
    AppState {
        agent_id: agent_id.into(),
        operations: OperationsService::new(engine, WsState::new()),
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Operations
        .route(
            "/operations",
            get(operations::list_operations).post(operations::submit_operation),
        )
        .route("/operations/{id}", get(operations::get_operation))
        .route("/operations/{id}/cancel", post(operations::cancel_operation))
        // WebSocket endpoint
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
