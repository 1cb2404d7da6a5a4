//! WebSocket command handlers.

use super::{AgentStatusPayload, WsCommand, WsEvent};
use crate::api::{health::uptime_secs, AppState};
use tracing::{info, warn};
use uuid::Uuid;

/// Handle a command received from a subscriber
pub async fn handle_command(command: WsCommand, state: &AppState) {
    match command {
        WsCommand::CancelOperation { operation_id } => {
            handle_cancel(operation_id, state).await;
        }
        WsCommand::GetStatus => {
            handle_get_status(state).await;
        }
    }
}

async fn handle_cancel(operation_id: Uuid, state: &AppState) {
    info!("Received cancel command for operation {}", operation_id);

    if state.operations.cancel(operation_id).await.is_none() {
        warn!("Cancel requested for unknown operation {}", operation_id);
    }
}

/// The status goes out as a broadcast like every other event.
async fn handle_get_status(state: &AppState) {
    let active_operations = state.operations.running_count().await;

    state
        .operations
        .events()
        .broadcast(WsEvent::AgentStatus(AgentStatusPayload {
            agent_id: state.agent_id.clone(),
            status: if active_operations > 0 { "running" } else { "idle" }.to_string(),
            active_operations,
            uptime_secs: uptime_secs(),
        }));
}
