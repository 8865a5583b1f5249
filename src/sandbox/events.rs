use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::breaker::CircuitState;
use super::health::HealthStatus;
use super::models::{FailureKind, RecoveryResult, RecoveryTrigger};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SandboxEvent {
    SandboxRegistered {
        session_id: String,
        sandbox_id: String,
    },
    SandboxUnregistered {
        session_id: String,
    },
    HealthChanged {
        session_id: String,
        sandbox_id: String,
        from: HealthStatus,
        to: HealthStatus,
        consecutive_failures: u32,
        last_error: Option<String>,
    },
    CircuitStateChanged {
        session_id: String,
        state: CircuitState,
    },
    RecoveryStarted {
        session_id: String,
        trigger: RecoveryTrigger,
        failure_kind: FailureKind,
    },
    RecoveryCompleted {
        session_id: String,
        trigger: RecoveryTrigger,
        result: RecoveryResult,
    },

    // Lifecycle manager
    SandboxCreated {
        session_id: String,
        sandbox_id: String,
    },
    SandboxTerminated {
        session_id: String,
        sandbox_id: String,
    },
    SandboxEvicted {
        session_id: String,
        sandbox_id: String,
        idle_secs: u64,
    },
}

/// Serialize and broadcast an event to every subscriber.
/// Returns silently even if nobody is listening.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &SandboxEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize SandboxEvent");
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    run_socket_loop(sender, receiver, rx).await;
}

/// Forward broadcast events to one client with ping/pong keepalive.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the connection is
/// treated as dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
