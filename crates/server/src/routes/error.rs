//! JSON error responses for the management API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use model_store::{ErrorKind, StoreError};
use serde::Serialize;
use tracing::error;

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: Option<String>,
}

pub fn api_error(status: StatusCode, message: impl Into<String>, error_type: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                message: message.into(),
                r#type: error_type.to_string(),
                code: None,
            },
        }),
    )
        .into_response()
}

/// Handler error wrapping a store failure.
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match self.0.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
            ErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, "invalid_request"),
            ErrorKind::Format => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_model_file"),
            ErrorKind::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            ErrorKind::Integrity => (StatusCode::INTERNAL_SERVER_ERROR, "integrity_error"),
            ErrorKind::StorageIo => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: ErrorDetail {
                    message: self.0.to_string(),
                    r#type: error_type.to_string(),
                    code: Some(self.0.message_key().as_str().to_string()),
                },
            }),
        )
            .into_response()
    }
}

/// Run blocking store work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ApiError(e).into_response()),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            "server_error",
        )),
    }
}
