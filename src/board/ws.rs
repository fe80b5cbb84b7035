use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error};

use super::api::AppState;
use super::db::CascadeSummary;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    ClientCreated {
        client: Client,
    },
    ClientKeyChanged {
        client: Client,
    },
    ClientDeleted {
        client_id: i64,
        removed: CascadeSummary,
    },
    ProjectCreated {
        project: Project,
    },
    ProjectDeleted {
        project_id: i64,
        removed: CascadeSummary,
    },
    SprintCreated {
        sprint: Sprint,
    },
    SprintDeleted {
        sprint_id: i64,
    },
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskDeleted {
        task_id: i64,
    },
    SlugAssigned {
        kind: EntityKind,
        entity_id: i64,
        slug: String,
    },
    BackfillCompleted {
        report: BackfillReport,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();
    debug!("websocket client connected");
    run_socket_loop(sender, receiver, rx).await;
    debug!("websocket client disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards board events, drains client frames, and pings periodically. If
/// no Pong arrives within [`PONG_TIMEOUT`] the connection is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick fires immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket pong timeout");
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
                        debug!(skipped, "websocket subscriber lagged");
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

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            error!(error = %e, "failed to serialize WsMessage");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: 3,
            project_id: 1,
            sprint_id: None,
            title: "Wireframes".to_string(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: Priority::High,
            due_date: None,
            slug: Some("ACME-3".to_string()),
            slug_key: Some("ACME".to_string()),
            slug_number: Some(3),
            created_at: "2024-01-01".to_string(),
            updated_at: "2024-01-01".to_string(),
        }
    }

    #[test]
    fn test_task_created_serialization() {
        let msg = WsMessage::TaskCreated { task: sample_task() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"TaskCreated\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"slug\":\"ACME-3\""));
    }

    #[test]
    fn test_slug_assigned_serialization() {
        let msg = WsMessage::SlugAssigned {
            kind: EntityKind::Sprint,
            entity_id: 9,
            slug: "ACME-S-2".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"SlugAssigned\""));
        assert!(json.contains("\"kind\":\"sprint\""));
        assert!(json.contains("\"entity_id\":9"));
    }

    #[test]
    fn test_client_deleted_carries_cascade_counts() {
        let msg = WsMessage::ClientDeleted {
            client_id: 4,
            removed: CascadeSummary {
                projects: 2,
                sprints: 1,
                tasks: 7,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"client_id\":4"));
        assert!(json.contains("\"tasks\":7"));
    }

    #[test]
    fn test_ws_message_roundtrip_deserialization() {
        let json = r#"{"type":"TaskDeleted","data":{"task_id":12}}"#;
        let msg: WsMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsMessage::TaskDeleted { task_id } => assert_eq!(task_id, 12),
            _ => panic!("Expected TaskDeleted variant"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_channel_delivers_to_subscribers() {
        let (tx, _) = tokio::sync::broadcast::channel::<String>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        broadcast_message(&tx, &WsMessage::SprintDeleted { sprint_id: 1 });

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert!(received1.contains("SprintDeleted"));
        assert_eq!(received1, received2);
    }

    #[tokio::test]
    async fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = tokio::sync::broadcast::channel::<String>(16);
        broadcast_message(&tx, &WsMessage::TaskDeleted { task_id: 1 });
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
    }
}
