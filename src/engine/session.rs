//! Per-file upload session state.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::FileDescriptor;

/// Persisted session status. Terminal outcomes never reach disk; a session
/// is deleted on completion or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Paused,
}

/// Engine-internal record of one file's upload, keyed by descriptor id and
/// mirrored durably. Runtime fields are rebuilt on restore and never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Server-assigned upload id, empty until `initiate` succeeds.
    pub server_upload_id: String,
    pub source_ref: String,
    pub descriptor: FileDescriptor,
    pub total_chunks: usize,
    pub chunk_size: u64,
    pub uploaded_chunks: BTreeSet<usize>,
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub file_hash: Option<String>,
    pub status: SessionStatus,
    /// Unix seconds; sessions older than the expiry are dropped on load.
    pub created_at: i64,
    #[serde(skip)]
    pub runtime: SessionRuntime,
}

/// In-memory-only session state.
#[derive(Debug, Default, Clone)]
pub struct SessionRuntime {
    pub is_paused: bool,
    pub is_cancelled: bool,
    /// Set when a chunk exhausted its retries; stops the scheduler from
    /// spawning further work for this session.
    pub failed: bool,
    /// Chunk indices currently owned by a worker.
    pub active_chunks: BTreeSet<usize>,
    /// Abort token per in-flight chunk attempt. Entries are replaced on
    /// retry; removal requires pointer identity with the replacing token.
    pub chunk_aborts: HashMap<usize, Arc<CancellationToken>>,
    /// Decoded file bytes, read once per session and sliced per chunk.
    pub cached_bytes: Option<Bytes>,
}

impl Session {
    pub fn new(descriptor: FileDescriptor, source_ref: impl Into<String>, chunk_size: u64) -> Self {
        let total_chunks = chunk_count(descriptor.size, chunk_size);
        Self {
            server_upload_id: String::new(),
            source_ref: source_ref.into(),
            descriptor,
            total_chunks,
            chunk_size,
            uploaded_chunks: BTreeSet::new(),
            uploaded_bytes: 0,
            file_hash: None,
            status: SessionStatus::Uploading,
            created_at: Utc::now().timestamp(),
            runtime: SessionRuntime::default(),
        }
    }

    /// Adopt the chunk geometry the server negotiated.
    pub fn apply_server_geometry(&mut self, upload_id: &str, chunk_size: u64, total_chunks: usize) {
        self.server_upload_id = upload_id.to_string();
        if chunk_size > 0 {
            self.chunk_size = chunk_size;
        }
        self.total_chunks = if total_chunks > 0 {
            total_chunks
        } else {
            chunk_count(self.descriptor.size, self.chunk_size)
        };
    }

    /// Expected byte count of a chunk; the final chunk carries the remainder.
    pub fn chunk_len(&self, index: usize) -> u64 {
        if self.chunk_size == 0 {
            return self.descriptor.size;
        }
        let start = index as u64 * self.chunk_size;
        self.descriptor.size.saturating_sub(start).min(self.chunk_size)
    }

    /// Byte range `[start, end)` of a chunk within the file.
    pub fn chunk_range(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.chunk_size;
        (start, start + self.chunk_len(index))
    }

    /// Lowest chunk index that is neither uploaded nor in flight.
    pub fn next_pending_chunk(&self) -> Option<usize> {
        (0..self.total_chunks).find(|index| {
            !self.uploaded_chunks.contains(index) && !self.runtime.active_chunks.contains(index)
        })
    }

    pub fn all_chunks_uploaded(&self) -> bool {
        self.uploaded_chunks.len() >= self.total_chunks
    }

    /// Record a successful chunk. Idempotent on the index.
    pub fn mark_uploaded(&mut self, index: usize) {
        if self.uploaded_chunks.insert(index) {
            self.uploaded_bytes += self.chunk_len(index);
        }
    }
}

/// `ceil(size / chunk_size)`, with a floor of one chunk.
pub fn chunk_count(size: u64, chunk_size: u64) -> usize {
    if size == 0 || chunk_size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(size: u64) -> FileDescriptor {
        FileDescriptor {
            id: "f1".to_string(),
            name: "clip.mp4".to_string(),
            size,
            mime_type: "video/mp4".to_string(),
            source_ref: None,
        }
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(2 * 1024 * 1024 + 1, 1024 * 1024), 3);
    }

    #[test]
    fn final_chunk_carries_remainder() {
        let session = Session::new(descriptor(1024 + 1), "ref", 1024);
        assert_eq!(session.total_chunks, 2);
        assert_eq!(session.chunk_len(0), 1024);
        assert_eq!(session.chunk_len(1), 1);
        assert_eq!(session.chunk_range(1), (1024, 1025));
    }

    #[test]
    fn file_exactly_at_chunk_size_is_one_full_chunk() {
        let session = Session::new(descriptor(1024), "ref", 1024);
        assert_eq!(session.total_chunks, 1);
        assert_eq!(session.chunk_len(0), 1024);
    }

    #[test]
    fn pending_skips_uploaded_and_active() {
        let mut session = Session::new(descriptor(3 * 1024), "ref", 1024);
        session.mark_uploaded(0);
        session.runtime.active_chunks.insert(1);
        assert_eq!(session.next_pending_chunk(), Some(2));
    }

    #[test]
    fn mark_uploaded_is_idempotent_on_bytes() {
        let mut session = Session::new(descriptor(2048), "ref", 1024);
        session.mark_uploaded(0);
        session.mark_uploaded(0);
        assert_eq!(session.uploaded_bytes, 1024);
        assert_eq!(
            session.uploaded_bytes,
            session
                .uploaded_chunks
                .iter()
                .map(|i| session.chunk_len(*i))
                .sum::<u64>()
        );
    }

    #[test]
    fn runtime_state_survives_serde_as_default() {
        let mut session = Session::new(descriptor(2048), "ref", 1024);
        session.runtime.is_paused = true;
        session.runtime.cached_bytes = Some(Bytes::from_static(b"xyz"));
        session.mark_uploaded(0);

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert!(!restored.runtime.is_paused);
        assert!(restored.runtime.cached_bytes.is_none());
        assert!(restored.uploaded_chunks.contains(&0));
        assert_eq!(restored.uploaded_bytes, 1024);
    }

    #[test]
    fn server_geometry_overrides_provisional_math() {
        let mut session = Session::new(descriptor(2 * 1024 * 1024), "ref", 512 * 1024);
        assert_eq!(session.total_chunks, 4);
        session.apply_server_geometry("u1", 1024 * 1024, 2);
        assert_eq!(session.server_upload_id, "u1");
        assert_eq!(session.chunk_size, 1024 * 1024);
        assert_eq!(session.total_chunks, 2);
    }
}
