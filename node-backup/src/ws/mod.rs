//! WebSocket stream of operation events.
//!
//! Subscribers receive every lifecycle and progress event of the agent's
//! operations and may send control commands back (cancel, status).

pub mod handler;

use crate::request::OperationKind;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum number of queued messages per subscriber
const BROADCAST_CAPACITY: usize = 1000;

/// Events sent from the agent to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsEvent {
    #[serde(rename = "operation:started")]
    OperationStarted {
        operation_id: Uuid,
        kind: OperationKind,
    },

    #[serde(rename = "operation:progress")]
    OperationProgress(OperationProgressPayload),

    #[serde(rename = "operation:completed")]
    OperationCompleted { operation_id: Uuid },

    #[serde(rename = "operation:failed")]
    OperationFailed { operation_id: Uuid, error: String },

    #[serde(rename = "agent:status")]
    AgentStatus(AgentStatusPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationProgressPayload {
    pub operation_id: Uuid,
    pub percent: f64,
    pub completed_entries: usize,
    pub total_entries: usize,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub speed: String,
    pub eta_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusPayload {
    pub agent_id: String,
    pub status: String, // "idle", "running"
    pub active_operations: usize,
    pub uptime_secs: u64,
}

/// Commands received from subscribers
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsCommand {
    #[serde(rename = "operation:cancel")]
    CancelOperation { operation_id: Uuid },

    #[serde(rename = "agent:status")]
    GetStatus,
}

/// Broadcast hub shared by the operations service and all connections
#[derive(Clone)]
pub struct WsState {
    tx: broadcast::Sender<WsEvent>,
}

impl WsState {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Send an event to every subscriber. Events without subscribers are dropped.
    pub fn broadcast(&self, event: WsEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Broadcast event to {} subscriber(s)", count),
            Err(_) => debug!("No subscribers for event"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }
}

impl Default for WsState {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<crate::api::AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, state: crate::api::AppState) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.operations.events().subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {} event(s) skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize event: {:?}", e),
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<WsCommand>(&text) {
                    Ok(command) => handler::handle_command(command, &state).await,
                    Err(e) => warn!("Failed to parse WebSocket command: {:?}", e),
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
