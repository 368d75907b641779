use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::AppState;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Platform events ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PlatformEvent {
    AppCreated {
        app: App,
    },
    AppUpdated {
        app: App,
        requires_wipe: bool,
    },
    AppDeleted {
        name: String,
    },
    DeployStarted {
        name: String,
        trigger: DeployTrigger,
    },
    DeployFinished {
        name: String,
        trigger: DeployTrigger,
        success: bool,
        error: Option<String>,
    },
    StatusChanged {
        name: String,
        status: AppStatus,
        detail: Option<String>,
    },
    LogLine {
        name: String,
        line: LogLine,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards broadcast events, drains client frames, and drops the
/// connection if no Pong arrives within [`PONG_TIMEOUT`] of a Ping.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket client missed pong; closing");
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
                        tracing::debug!(skipped, "websocket subscriber lagged");
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

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to all connected clients.
/// Returns silently when nobody is listening.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &PlatformEvent) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // no receivers is fine
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize platform event");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_finished_serialization() {
        let msg = PlatformEvent::DeployFinished {
            name: "demo".into(),
            trigger: DeployTrigger::Webhook,
            success: false,
            error: Some("exit status 1".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"DeployFinished\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"trigger\":\"webhook\""));
    }

    #[test]
    fn test_status_changed_serialization() {
        let msg = PlatformEvent::StatusChanged {
            name: "demo".into(),
            status: AppStatus::Error,
            detail: Some("exited with code 3".into()),
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "StatusChanged");
        assert_eq!(value["data"]["status"], "error");
    }

    #[test]
    fn test_log_line_roundtrip() {
        let msg = PlatformEvent::LogLine {
            name: "demo".into(),
            line: LogLine {
                seq: 4,
                timestamp: "2026-01-01T00:00:00Z".into(),
                stream: LogStream::Stderr,
                text: "boom".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: PlatformEvent = serde_json::from_str(&json).unwrap();
        match back {
            PlatformEvent::LogLine { name, line } => {
                assert_eq!(name, "demo");
                assert_eq!(line.seq, 4);
                assert_eq!(line.stream, LogStream::Stderr);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_channel_delivers_to_subscribers() {
        let (tx, mut rx) = broadcast::channel(16);
        broadcast_message(&tx, &PlatformEvent::AppDeleted { name: "demo".into() });
        let received = rx.recv().await.unwrap();
        assert!(received.contains("AppDeleted"));
        assert!(received.contains("demo"));
    }

    #[test]
    fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<String>(16);
        broadcast_message(&tx, &PlatformEvent::AppDeleted { name: "x".into() });
    }

    #[test]
    fn test_keepalive_constants() {
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
        assert_eq!(PONG_TIMEOUT, Duration::from_secs(60));
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
