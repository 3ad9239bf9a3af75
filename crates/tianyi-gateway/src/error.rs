use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use tianyi_core::error::TianyiError;

/// HTTP-facing error wrapper.
///
/// Auth, validation, and not-found errors reach the client verbatim;
/// everything else is logged and collapsed into a generic 5xx.
pub struct ApiError(pub TianyiError);

impl From<TianyiError> for ApiError {
    fn from(e: TianyiError) -> Self {
        Self(e)
    }
}

impl From<tianyi_users::UserError> for ApiError {
    fn from(e: tianyi_users::UserError) -> Self {
        Self(e.into())
    }
}

impl From<tianyi_store::StoreError> for ApiError {
    fn from(e: tianyi_store::StoreError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            TianyiError::AuthFailed(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            TianyiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            TianyiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            other => {
                error!(code = other.code(), error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "服务器内部错误".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
