//! Serves stored audio files.

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::artifact::{content_type_for_file, ArtifactError};
use crate::server::state::SharedState;
use crate::server::utils::api_error;

pub async fn serve_upload_handler(
    State(state): State<SharedState>,
    Path(file_name): Path<String>,
) -> Response {
    match state.uploads.read(&file_name).await {
        Ok(Some(data)) => {
            let mut response = (StatusCode::OK, data).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type_for_file(&file_name)),
            );
            headers.insert(
                "cross-origin-resource-policy",
                HeaderValue::from_static("cross-origin"),
            );
            response
        }
        Ok(None) | Err(ArtifactError::InvalidRef(_)) => {
            api_error(StatusCode::NOT_FOUND, "file not found")
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
