//! Abstraction over file access.
//!
//! The engine only needs an existence/size probe and a whole-file read; the
//! platform-specific picker hands us opaque `source_ref` strings which the
//! reader resolves.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result of probing a blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStat {
    pub exists: bool,
    pub size: u64,
}

/// Errors raised by blob access.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The underlying file disappeared between enqueue and upload.
    #[error("source missing: {0}")]
    SourceMissing(String),
    #[error("failed to read source {source_ref}: {message}")]
    Read { source_ref: String, message: String },
}

/// Read access to user-selected files.
#[async_trait]
pub trait BlobReader: Send + Sync {
    /// Probe for existence and size. A missing file reports
    /// `exists == false` rather than an error.
    async fn stat(&self, source_ref: &str) -> Result<BlobStat, BlobError>;

    /// Read the full contents. The caller is expected to cache the result;
    /// no range reads are assumed.
    async fn read_all(&self, source_ref: &str) -> Result<Bytes, BlobError>;
}

/// Blob reader over the local filesystem. Source refs are paths, optionally
/// resolved against a root directory.
pub struct FsBlobReader {
    root: Option<PathBuf>,
}

impl FsBlobReader {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, source_ref: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(source_ref),
            None => PathBuf::from(source_ref),
        }
    }
}

impl Default for FsBlobReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobReader for FsBlobReader {
    async fn stat(&self, source_ref: &str) -> Result<BlobStat, BlobError> {
        let path = self.resolve(source_ref);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(BlobStat {
                exists: meta.is_file(),
                size: meta.len(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BlobStat::default()),
            Err(err) => Err(BlobError::Read {
                source_ref: source_ref.to_string(),
                message: err.to_string(),
            }),
        }
    }

    async fn read_all(&self, source_ref: &str) -> Result<Bytes, BlobError> {
        let path = self.resolve(source_ref);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::SourceMissing(source_ref.to_string()))
            }
            Err(err) => Err(BlobError::Read {
                source_ref: source_ref.to_string(),
                message: err.to_string(),
            }),
        }
    }
}
