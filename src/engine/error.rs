//! Error types for the upload engine.

use thiserror::Error;

use crate::client::ApiError;

pub type UploadResult<T> = Result<T, UploadError>;

/// Upload failure kinds surfaced through status callbacks.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The source file disappeared between enqueue and upload.
    #[error("source missing")]
    SourceMissing,

    /// Fingerprinting the source failed.
    #[error("hash failed: {0}")]
    HashFailed(String),

    /// The upload was cancelled or paused mid-flight. Never retried.
    #[error("upload cancelled")]
    Cancelled,

    /// A backend call failed (network or server).
    #[error("{0}")]
    Api(ApiError),
}

impl From<ApiError> for UploadError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Cancelled => UploadError::Cancelled,
            other => UploadError::Api(other),
        }
    }
}

impl UploadError {
    /// Whether the engine's retry policy applies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Api(ApiError::NetworkUnavailable(_) | ApiError::Server { .. })
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}
