//! MD5 fingerprinting of source blobs.
//!
//! The digest keys server-side deduplication; it is a fingerprint, not a
//! security primitive. The buffer is digested in bounded windows, yielding
//! between windows so a large file does not monopolize the scheduler.

use thiserror::Error;

use crate::blob::BlobReader;

/// Window size for incremental digesting (2 MiB).
const HASH_WINDOW: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
#[error("hash failed: {0}")]
pub struct HashFailed(pub String);

/// Compute the lowercase hex MD5 digest of a blob.
pub async fn hash_blob(reader: &dyn BlobReader, source_ref: &str) -> Result<String, HashFailed> {
    let data = reader
        .read_all(source_ref)
        .await
        .map_err(|err| HashFailed(err.to_string()))?;

    let mut context = md5::Context::new();
    for window in data.chunks(HASH_WINDOW) {
        context.consume(window);
        tokio::task::yield_now().await;
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobError, BlobStat};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct MemoryBlobs(HashMap<String, Bytes>);

    #[async_trait]
    impl BlobReader for MemoryBlobs {
        async fn stat(&self, source_ref: &str) -> Result<BlobStat, BlobError> {
            Ok(self
                .0
                .get(source_ref)
                .map(|data| BlobStat {
                    exists: true,
                    size: data.len() as u64,
                })
                .unwrap_or_default())
        }

        async fn read_all(&self, source_ref: &str) -> Result<Bytes, BlobError> {
            self.0
                .get(source_ref)
                .cloned()
                .ok_or_else(|| BlobError::SourceMissing(source_ref.to_string()))
        }
    }

    #[tokio::test]
    async fn digest_matches_known_value() {
        let blobs = MemoryBlobs(HashMap::from([(
            "a".to_string(),
            Bytes::from_static(b"hello world"),
        )]));
        let digest = hash_blob(&blobs, "a").await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn windowed_digest_equals_single_shot() {
        // Cross the window boundary so multiple consume calls happen.
        let data: Vec<u8> = (0..(HASH_WINDOW + 1234)).map(|i| (i % 251) as u8).collect();
        let expected = format!("{:x}", md5::compute(&data));

        let blobs = MemoryBlobs(HashMap::from([("big".to_string(), Bytes::from(data))]));
        let digest = hash_blob(&blobs, "big").await.unwrap();
        assert_eq!(digest, expected);
    }

    #[tokio::test]
    async fn missing_blob_reports_hash_failed() {
        let blobs = MemoryBlobs(HashMap::new());
        let err = hash_blob(&blobs, "gone").await.unwrap_err();
        assert!(err.to_string().contains("gone"));
    }
}
