//! WebSocket upgrade and live connection handling.
//!
//! A connection starts anonymous and joins a user room with a `join` frame.
//! After that it receives every event addressed to that user and may report
//! chat windows opening and closing.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::logging;
use crate::notifier::ServerEvent;
use crate::server::config::MAX_WS_CONNECTIONS;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, ActingUser};

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Join { user_id: String },
    ChatOpened { chat_partner_id: String },
    ChatClosed { chat_partner_id: String },
    Leave,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    acting: Option<ActingUser>,
) -> Response {
    let current = state.ws_connections.load(Ordering::Relaxed);
    if current >= MAX_WS_CONNECTIONS {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("too many WebSocket connections (max {MAX_WS_CONNECTIONS})"),
        );
    }

    let authenticated = acting.map(|ActingUser(id)| id);
    ws.on_upgrade(move |socket| ws_connection(socket, state, authenticated))
        .into_response()
}

async fn recv_event(
    rx: &mut Option<broadcast::Receiver<ServerEvent>>,
) -> Result<ServerEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(WsMessage::Text(json)).await.is_ok(),
        Err(_) => true,
    }
}

async fn ws_connection(mut socket: WebSocket, state: SharedState, authenticated: Option<String>) {
    let notifier = state.engine.notifier().clone();
    let connection_id = state.next_connection_id();
    state.ws_connections.fetch_add(1, Ordering::Relaxed);

    let mut rx: Option<broadcast::Receiver<ServerEvent>> = None;
    let mut user_id: Option<String> = None;

    loop {
        tokio::select! {
            result = recv_event(&mut rx) => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(connection_id = %connection_id, skipped = n, "ws client lagged");
                        if !send_event(&mut socket, &ServerEvent::EventsMissed { count: n }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = socket.send(WsMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "ignoring malformed frame");
                        continue;
                    }
                };
                match frame {
                    ClientFrame::Join { user_id: requested } => {
                        if authenticated.as_deref().is_some_and(|a| a != requested) {
                            tracing::warn!(
                                connection_id = %connection_id,
                                requested = %logging::user_id(&requested),
                                "join refused, does not match authenticated user"
                            );
                            continue;
                        }
                        if user_id.as_deref() == Some(requested.as_str()) {
                            continue;
                        }
                        if user_id.is_some() {
                            rx = None;
                            notifier.disconnect(&connection_id).await;
                        }
                        rx = Some(notifier.join(&connection_id, &requested).await);
                        tracing::info!(
                            connection_id = %connection_id,
                            user = %logging::user_id(&requested),
                            "websocket joined"
                        );
                        user_id = Some(requested);
                    }
                    ClientFrame::ChatOpened { chat_partner_id } => match &user_id {
                        Some(user) => notifier.chat_opened(user, &chat_partner_id).await,
                        None => tracing::debug!(connection_id = %connection_id, "chat_opened before join"),
                    },
                    ClientFrame::ChatClosed { chat_partner_id } => match &user_id {
                        Some(user) => notifier.chat_closed(user, &chat_partner_id).await,
                        None => tracing::debug!(connection_id = %connection_id, "chat_closed before join"),
                    },
                    ClientFrame::Leave => {
                        rx = None;
                        if user_id.take().is_some() {
                            notifier.disconnect(&connection_id).await;
                        }
                    }
                }
            }
        }
    }

    drop(rx);
    notifier.disconnect(&connection_id).await;
    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(connection_id = %connection_id, "websocket closed");
}
