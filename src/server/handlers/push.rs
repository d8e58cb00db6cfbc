//! Push subscription handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::ledger::SubscriptionUpsert;
use crate::logging;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, ActingUser};

#[derive(Deserialize)]
pub struct SubscriptionBody {
    endpoint: String,
    #[serde(default)]
    keys: serde_json::Value,
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    subscription: SubscriptionBody,
}

#[derive(Deserialize)]
pub struct UnsubscribeRequest {
    endpoint: String,
}

pub async fn subscribe_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
    axum::Json(req): axum::Json<SubscribeRequest>,
) -> Response {
    let endpoint = req.subscription.endpoint.trim();
    if endpoint.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "subscription endpoint is required");
    }
    let keys = req.subscription.keys.to_string();
    let now = state.engine.now_ms();

    match state
        .engine
        .ledger()
        .upsert_subscription(&user_id, endpoint, &keys, now)
    {
        Ok(SubscriptionUpsert::Created) => {
            tracing::info!(user = %logging::user_id(&user_id), "push subscription added");
            (
                StatusCode::CREATED,
                axum::Json(serde_json::json!({ "status": "subscribed" })),
            )
                .into_response()
        }
        Ok(SubscriptionUpsert::Updated) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "updated" })),
        )
            .into_response(),
        Ok(SubscriptionUpsert::Unchanged) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "unchanged" })),
        )
            .into_response(),
        Err(e) => api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub async fn unsubscribe_handler(
    State(state): State<SharedState>,
    ActingUser(user_id): ActingUser,
    axum::Json(req): axum::Json<UnsubscribeRequest>,
) -> Response {
    match state
        .engine
        .ledger()
        .delete_subscription(&user_id, req.endpoint.trim())
    {
        Ok(true) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "unsubscribed" })),
        )
            .into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "subscription not found"),
        Err(e) => api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
