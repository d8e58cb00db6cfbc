//! Health check endpoint.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::server::state::SharedState;
use crate::server::utils::api_error;

pub async fn health_handler(State(state): State<SharedState>) -> Response {
    let messages = match state.engine.ledger().count_messages() {
        Ok(n) => n,
        Err(e) => return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    let body = serde_json::json!({
        "status": "ok",
        "messages": messages,
        "ws_connections": state.ws_connections.load(Ordering::Relaxed),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}
