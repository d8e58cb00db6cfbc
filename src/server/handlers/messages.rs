//! Message send, read, retrieval and deletion handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::Multipart;

use crate::lifecycle::AudioUpload;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, lifecycle_error, ActingUser};

/// `POST /api/messages/send`: multipart with `audio`, `receiver_id` and an
/// optional `lifespan`.
pub async fn send_handler(
    State(state): State<SharedState>,
    ActingUser(sender_id): ActingUser,
    mut multipart: Multipart,
) -> Response {
    let mut audio: Option<AudioUpload> = None;
    let mut receiver_id: Option<String> = None;
    let mut lifespan: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("invalid form: {e}")),
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audio" => {
                let content_type = field
                    .content_type()
                    .map(|ct| ct.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                match field.bytes().await {
                    Ok(bytes) => {
                        audio = Some(AudioUpload {
                            bytes: bytes.to_vec(),
                            content_type,
                        })
                    }
                    Err(e) => {
                        return api_error(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read audio: {e}"),
                        )
                    }
                }
            }
            "receiver_id" | "receiverId" => match field.text().await {
                Ok(text) => receiver_id = Some(text.trim().to_string()),
                Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
            },
            "lifespan" => match field.text().await {
                Ok(text) => lifespan = Some(text),
                Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
            },
            _ => {}
        }
    }

    let receiver_id = match receiver_id {
        Some(r) if !r.is_empty() => r,
        _ => return api_error(StatusCode::BAD_REQUEST, "receiver_id is required"),
    };
    if receiver_id == sender_id {
        return api_error(StatusCode::BAD_REQUEST, "cannot send a message to yourself");
    }

    match state
        .engine
        .create(&sender_id, &receiver_id, audio, lifespan.as_deref())
        .await
    {
        Ok(message) => (StatusCode::CREATED, axum::Json(message)).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

pub async fn get_message_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
    Path(message_id): Path<String>,
) -> Response {
    match state.engine.get_message(&message_id, &user_id) {
        Ok(message) => (StatusCode::OK, axum::Json(message)).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

pub async fn mark_read_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
    Path(message_id): Path<String>,
) -> Response {
    match state.engine.mark_read(&message_id, &user_id).await {
        Ok(message) => (StatusCode::OK, axum::Json(message)).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

pub async fn delete_message_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
    Path(message_id): Path<String>,
) -> Response {
    match state.engine.delete_message(&message_id, &user_id).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "deleted": message_id })),
        )
            .into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// `DELETE /api/messages/expired`: run a sweep pass now.
pub async fn sweep_now_handler(State(state): State<SharedState>) -> Response {
    match state.sweeper.run_once().await {
        Ok(report) => (StatusCode::OK, axum::Json(report)).into_response(),
        Err(e) => api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
