//! Shared helpers for handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::lifecycle::LifecycleError;
use crate::server::config::USER_HEADER;

/// Build a standard JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, axum::Json(body)).into_response()
}

pub fn status_for(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
        LifecycleError::NotFound => StatusCode::NOT_FOUND,
        LifecycleError::Forbidden(_) => StatusCode::FORBIDDEN,
        LifecycleError::Storage(_) => StatusCode::BAD_GATEWAY,
        LifecycleError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Map an engine error to its JSON response.  Server-side failures are
/// logged since the client only sees a short message.
pub fn lifecycle_error(err: LifecycleError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::warn!(error = %err, status = status.as_u16(), "request failed");
    }
    api_error(status, err.to_string())
}

/// The authenticated caller, taken from the `X-User-Id` header.
#[derive(Debug, Clone)]
pub struct ActingUser(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        match user {
            Some(id) => Ok(ActingUser(id.to_string())),
            None => Err(api_error(
                StatusCode::UNAUTHORIZED,
                "missing X-User-Id header",
            )),
        }
    }
}
