//! Conversation listing and unread count handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::server::state::SharedState;
use crate::server::utils::{lifecycle_error, ActingUser};

pub async fn list_conversation_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
    Path(partner_id): Path<String>,
) -> Response {
    match state.engine.list_conversation(&user_id, &partner_id) {
        Ok(messages) => (StatusCode::OK, axum::Json(messages)).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

pub async fn unread_counts_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
) -> Response {
    match state.engine.unread_counts(&user_id) {
        Ok(counts) => (StatusCode::OK, axum::Json(counts)).into_response(),
        Err(e) => lifecycle_error(e),
    }
}
