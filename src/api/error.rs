//! Failure responses for the control API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::client::ApiError;
use crate::types::ValidationError;

/// Ways a control request can fail. Each variant renders with a stable
/// machine-readable code so host shells can branch without parsing prose.
#[derive(Debug)]
pub enum AppError {
    /// The id does not name a live upload item.
    UnknownUpload(String),
    /// The enqueue batch was rejected before anything was appended.
    InvalidBatch(ValidationError),
    /// The upload backend refused the request or could not be reached.
    Backend(ApiError),
    /// Anything else; details go to the log, not the wire.
    Internal(anyhow::Error),
}

/// Wire shape of a failed control request.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    code: &'static str,
    error: String,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::UnknownUpload(_) => StatusCode::NOT_FOUND,
            AppError::InvalidBatch(_) => StatusCode::BAD_REQUEST,
            AppError::Backend(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::UnknownUpload(_) => "unknown_upload",
            AppError::InvalidBatch(_) => "invalid_batch",
            AppError::Backend(_) => "backend_error",
            AppError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::UnknownUpload(id) => format!("no upload item with id {id}"),
            AppError::InvalidBatch(err) => err.to_string(),
            AppError::Backend(err) => err.to_string(),
            // Internal details stay out of responses.
            AppError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::InvalidBatch(err)
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        AppError::Backend(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let error = self.message();

        if status.is_server_error() {
            tracing::error!(target: "api", code, detail = ?self, "Control request failed");
        } else {
            tracing::warn!(target: "api", code, error = %error, "Control request rejected");
        }

        let body = ErrorBody {
            success: false,
            code,
            error,
        };
        (status, Json(body)).into_response()
    }
}
