//! Live Event Stream Route

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::AppState;

/// First client frame: the topics to subscribe to ("severity.high",
/// "service.payments", or "*")
#[derive(Debug, Deserialize)]
struct Subscribe {
    topics: Vec<String>,
}

/// Upgrade to a WebSocket event stream
pub async fn stream(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    // The handshake frame selects topics; anything else ends the session
    let topics = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Subscribe>(&text) {
            Ok(subscribe) if !subscribe.topics.is_empty() => subscribe.topics,
            _ => {
                debug!("Stream handshake rejected: bad subscribe frame");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
        _ => return,
    };

    let (subscriber_id, mut events) = state.engine.broadcaster().subscribe(topics);
    info!("Stream subscriber {} connected", subscriber_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(frame) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; other frames are ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.engine.broadcaster().unsubscribe(subscriber_id);
    info!("Stream subscriber {} disconnected", subscriber_id);
}
