//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::server::handlers;
use crate::server::state::SharedState;

/// Multipart framing allowance on top of the audio limit.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the complete Axum router with all API routes.
pub fn build_router(state: SharedState) -> Router {
    let upload_limit = state.max_audio_bytes + FORM_OVERHEAD_BYTES;

    Router::new()
        // Health
        .route("/api/health", get(handlers::health::health_handler))
        // Messages API
        .route(
            "/api/messages/send",
            post(handlers::messages::send_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/messages/expired",
            delete(handlers::messages::sweep_now_handler),
        )
        .route(
            "/api/messages/:message_id",
            get(handlers::messages::get_message_handler)
                .delete(handlers::messages::delete_message_handler),
        )
        .route(
            "/api/messages/:message_id/read",
            post(handlers::messages::mark_read_handler).put(handlers::messages::mark_read_handler),
        )
        // Conversations API
        .route(
            "/api/conversations/:partner_id/messages",
            get(handlers::conversations::list_conversation_handler),
        )
        .route(
            "/api/unread-counts",
            get(handlers::conversations::unread_counts_handler),
        )
        // Push API
        .route(
            "/api/push/subscribe",
            post(handlers::push::subscribe_handler),
        )
        .route(
            "/api/push/unsubscribe",
            post(handlers::push::unsubscribe_handler),
        )
        // Stored audio
        .route(
            "/uploads/:file_name",
            get(handlers::uploads::serve_upload_handler),
        )
        // WebSocket
        .route("/ws", get(handlers::websocket::ws_handler))
        .with_state(state)
}
