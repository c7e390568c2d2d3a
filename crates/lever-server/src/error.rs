use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use lever_core::LeverError;

/// JSON error body: `{ "code": ..., "message": ... }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// An error on its way out of a handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid or missing API key",
        )
    }
}

/// Status for each error kind.
pub fn status_for(err: &LeverError) -> StatusCode {
    match err {
        LeverError::AmbiguousPolicy { .. }
        | LeverError::UnscopedRun { .. }
        | LeverError::OverrideDenied(_) => StatusCode::FORBIDDEN,
        LeverError::InvalidPolicy { .. } | LeverError::ConfigValidation { .. } => {
            StatusCode::BAD_REQUEST
        }
        LeverError::PolicyNotFound(_) | LeverError::RunNotFound(_) => StatusCode::NOT_FOUND,
        LeverError::InvalidRunState { .. } => StatusCode::CONFLICT,
        LeverError::ChannelDispatch { .. } => StatusCode::BAD_GATEWAY,
        LeverError::Store(_)
        | LeverError::Config(_)
        | LeverError::Io(_)
        | LeverError::Serialization(_)
        | LeverError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<LeverError> for ApiError {
    fn from(err: LeverError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "request failed");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}
