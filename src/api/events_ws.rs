//! `/api/distribution/events` — WebSocket status push: connect greeting,
//! ping/pong, periodic heartbeats, and change-driven notifications.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::time::interval;
use tracing::debug;

use crate::distribution::session::DistributionEvent;

use super::AppState;

pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn overall_status(state: &AppState) -> serde_json::Value {
    let sessions = state.sessions.all_statuses();
    let degraded: Vec<String> = sessions
        .iter()
        .flat_map(|s| {
            s.distributors
                .iter()
                .filter(|d| d.state == crate::distribution::DistributorState::Degraded)
                .map(move |d| format!("{}/{}", s.id, d.name))
        })
        .collect();
    serde_json::json!({
        "sessions": sessions.len(),
        "streams": state.streams.count(),
        "degraded": degraded,
        "sync": state.engine.metrics(),
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let greeting = serde_json::json!({
        "type": "connected",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "overall_status": overall_status(&state),
    });
    if socket.send(Message::Text(greeting.to_string())).await.is_err() {
        return;
    }

    let mut events = state.sessions.subscribe_events();
    let mut heartbeat = interval(state.config.ws_heartbeat_interval);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            // Change-driven notifications.
            event = events.recv() => {
                let Ok(event) = event else { continue };
                let message = match &event {
                    DistributionEvent::DistributorDegraded { session_id, distributor } => {
                        serde_json::json!({
                            "type": "distributor_degraded",
                            "timestamp": chrono::Utc::now().to_rfc3339(),
                            "session_id": session_id,
                            "distributor": distributor,
                        })
                    }
                    DistributionEvent::SessionCreated { session_id }
                    | DistributionEvent::SessionEnded { session_id }
                    | DistributionEvent::SessionUpdate { session_id } => {
                        serde_json::json!({
                            "type": "session_update",
                            "timestamp": chrono::Utc::now().to_rfc3339(),
                            "session_id": session_id,
                            "change": event,
                        })
                    }
                };
                if socket.send(Message::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            // Fixed-cadence heartbeat with the aggregate picture.
            _ = heartbeat.tick() => {
                let message = serde_json::json!({
                    "type": "stream_update",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "overall_status": overall_status(&state),
                });
                if socket.send(Message::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            // Client messages: ping/pong plus graceful close.
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: Option<serde_json::Value> = serde_json::from_str(&text).ok();
                        let is_ping = parsed
                            .as_ref()
                            .and_then(|v| v.get("type"))
                            .and_then(|t| t.as_str())
                            == Some("ping");
                        if is_ping {
                            let pong = serde_json::json!({
                                "type": "pong",
                                "timestamp": chrono::Utc::now().to_rfc3339(),
                            });
                            if socket.send(Message::Text(pong.to_string())).await.is_err() {
                                break;
                            }
                        } else {
                            debug!("ignoring ws message: {text}");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
