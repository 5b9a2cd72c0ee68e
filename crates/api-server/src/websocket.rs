//! WebSocket handlers for real-time saga and reconciliation updates.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use lifecycle_engine::StepEvent;
use equity_monitor::ReconciliationEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message wrapper.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    /// Saga step progress.
    Step(StepEvent),
    /// Cache drift detected by the reconciliation poller.
    Reconciliation(ReconciliationEvent),
    /// Subscription confirmation.
    Subscribed { channel: String },
    /// Ping/pong for keepalive.
    Pong,
}

/// Client request over the socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsRequest {
    Ping,
}

/// WebSocket upgrade handler for lifecycle operation progress.
pub async fn ws_operations_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_operations_socket(socket, state))
}

/// WebSocket upgrade handler for reconciliation events.
pub async fn ws_reconciliation_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_reconciliation_socket(socket, state))
}

async fn handle_operations_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut step_rx = state.saga.subscribe_steps();

    info!("WebSocket client connected to operations channel");

    let msg = WsMessage::Subscribed {
        channel: "operations".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&msg) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    loop {
        tokio::select! {
            Some(msg) = receiver.next() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(WsRequest::Ping) = serde_json::from_str(&text) {
                            if let Ok(json) = serde_json::to_string(&WsMessage::Pong) {
                                let _ = sender.send(Message::Text(json.into())).await;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket client disconnected from operations");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
            Ok(event) = step_rx.recv() => {
                let msg = WsMessage::Step(event);
                if let Ok(json) = serde_json::to_string(&msg) {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket client disconnected from operations channel");
}

async fn handle_reconciliation_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.reconciler.subscribe();

    info!("WebSocket client connected to reconciliation channel");

    let msg = WsMessage::Subscribed {
        channel: "reconciliation".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&msg) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    loop {
        tokio::select! {
            Some(msg) = receiver.next() => {
                match msg {
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            Ok(event) = event_rx.recv() => {
                let msg = WsMessage::Reconciliation(event);
                if let Ok(json) = serde_json::to_string(&msg) {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket client disconnected from reconciliation channel");
}
