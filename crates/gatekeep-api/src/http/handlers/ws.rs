//! WebSocket handler streaming approval events to a connected user.
//!
//! The `/ws/events` endpoint upgrades an HTTP connection to a WebSocket and
//! registers it with the notification hub. The first frame is always
//! `connected`; after that the client receives every event addressed to it
//! plus periodic heartbeats.
//!
//! Disconnecting is a normal unregister, not an error. When the hub drops
//! the connection (slow consumer, connection cap, shutdown) the socket is
//! closed.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use gatekeep_types::identity::User;

use crate::http::extractors::caller::Caller;
use crate::state::AppState;

/// Incoming command from a WebSocket client.
///
/// Unknown or malformed messages are logged and ignored.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

const PONG: &str = r#"{"type":"pong"}"#;

/// Upgrade to a WebSocket subscribed to the caller's events.
///
/// Mounted at `/ws/events`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Caller(user): Caller,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, user: User) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut subscription = state.hub.register(user.id, user.company_id);
    let connection_id = subscription.connection_id;

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Evicted by the hub or the hub shut down.
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) && ws_sender.send(Message::Text(PONG.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(user_id = %user.id, "WebSocket receive error: {err}");
                        break;
                    }
                    // Binary, ping and pong protocol frames are handled by axum.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unregister(&user.id, connection_id);
    tracing::debug!(user_id = %user.id, %connection_id, "WebSocket connection closed");
}

fn is_ping(text: &str) -> bool {
    match serde_json::from_str::<WsCommand>(text) {
        Ok(WsCommand::Ping) => true,
        Err(err) => {
            tracing::warn!(raw = %text, error = %err, "Ignoring malformed WebSocket command");
            false
        }
    }
}
