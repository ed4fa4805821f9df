//! Shared data model for upload items, progress, and history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::UploadConfig;

/// User-visible identity of a file selected for upload.
///
/// `id` is an opaque client-generated string that stays stable for the
/// lifetime of the item; `source_ref` is the opaque handle the blob reader
/// resolves to actual bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

/// Lifecycle state of an upload item.
///
/// `Idle` exists only for schema compatibility with consumers; the core never
/// produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Idle,
    Queued,
    Uploading,
    Paused,
    Error,
    Completed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Idle => "idle",
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Error => "error",
            UploadStatus::Completed => "completed",
        }
    }
}

/// Byte-level progress of a single item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

impl Progress {
    /// Build a progress value; uploaded bytes are clamped to the total and
    /// the percentage is rounded to the nearest integer in `[0, 100]`.
    pub fn new(uploaded_bytes: u64, total_bytes: u64) -> Self {
        let uploaded_bytes = uploaded_bytes.min(total_bytes);
        Self {
            uploaded_bytes,
            total_bytes,
            percent: rounded_percent(uploaded_bytes, total_bytes),
        }
    }

    pub fn complete(total_bytes: u64) -> Self {
        Self::new(total_bytes, total_bytes)
    }
}

/// Round `100 * uploaded / total` to the nearest integer, clamped to 100.
pub fn rounded_percent(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let uploaded = uploaded.min(total) as u128;
    let total = total as u128;
    ((uploaded * 100 + total / 2) / total).min(100) as u8
}

/// Observable row for one enqueued file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub file: FileDescriptor,
    pub status: UploadStatus,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// User-initiated retries, not internal chunk retries.
    pub retries: u32,
}

impl UploadItem {
    pub fn queued(file: FileDescriptor) -> Self {
        let total = file.size;
        Self {
            file,
            status: UploadStatus::Queued,
            progress: Progress::new(0, total),
            error_message: None,
            retries: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.file.id
    }
}

/// Aggregate of all upload items, in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    pub items: Vec<UploadItem>,
    pub overall_percent: u8,
}

impl AggregateState {
    /// Recompute the overall percentage from the member items.
    pub fn recompute(&mut self) {
        let uploaded: u64 = self.items.iter().map(|i| i.progress.uploaded_bytes).sum();
        let total: u64 = self.items.iter().map(|i| i.progress.total_bytes).sum();
        self.overall_percent = rounded_percent(uploaded, total);
    }
}

/// Record of a finished upload, handed to the history sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// ISO-8601 completion timestamp.
    pub completed_at: String,
}

/// Rejection reasons for `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("file {name} exceeds the maximum size of {limit} bytes")]
    TooLarge { name: String, limit: u64 },
    #[error("file {name} has unsupported type {mime_type}")]
    WrongType { name: String, mime_type: String },
    #[error("batch exceeds the maximum of {limit} files")]
    TooManyFiles { limit: usize },
    #[error("file {id} is already enqueued")]
    Duplicate { id: String },
}

/// Validate a batch of descriptors against the configured limits and the
/// ids already present. The whole batch is rejected on the first offender.
pub fn validate_batch<'a>(
    descriptors: &[FileDescriptor],
    existing_ids: impl Iterator<Item = &'a str>,
    config: &UploadConfig,
) -> Result<(), ValidationError> {
    if descriptors.len() > config.max_files_per_batch {
        return Err(ValidationError::TooManyFiles {
            limit: config.max_files_per_batch,
        });
    }

    let mut seen: std::collections::HashSet<&str> = existing_ids.collect();
    for descriptor in descriptors {
        if !seen.insert(descriptor.id.as_str()) {
            return Err(ValidationError::Duplicate {
                id: descriptor.id.clone(),
            });
        }
        if descriptor.size > config.max_file_size {
            return Err(ValidationError::TooLarge {
                name: descriptor.name.clone(),
                limit: config.max_file_size,
            });
        }
        let mime = descriptor.mime_type.as_str();
        if !(mime.starts_with("image/") || mime.starts_with("video/")) {
            return Err(ValidationError::WrongType {
                name: descriptor.name.clone(),
                mime_type: descriptor.mime_type.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, size: u64, mime: &str) -> FileDescriptor {
        FileDescriptor {
            id: id.to_string(),
            name: format!("{id}.mp4"),
            size,
            mime_type: mime.to_string(),
            source_ref: None,
        }
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(Progress::new(0, 100).percent, 0);
        assert_eq!(Progress::new(50, 100).percent, 50);
        assert_eq!(Progress::new(100, 100).percent, 100);
        // Uploaded beyond total clamps rather than overflowing 100.
        assert_eq!(Progress::new(150, 100).percent, 100);
        assert_eq!(Progress::new(150, 100).uploaded_bytes, 100);
        // Empty file reports zero.
        assert_eq!(Progress::new(0, 0).percent, 0);
    }

    #[test]
    fn percent_one_byte_short_of_small_total_is_99() {
        assert_eq!(rounded_percent(99, 100), 99);
    }

    #[test]
    fn overall_percent_is_zero_when_empty() {
        let mut state = AggregateState::default();
        state.recompute();
        assert_eq!(state.overall_percent, 0);
    }

    #[test]
    fn overall_percent_weighs_items_by_bytes() {
        let mut state = AggregateState::default();
        let mut a = UploadItem::queued(descriptor("a", 100, "image/png"));
        a.progress = Progress::new(100, 100);
        let b = UploadItem::queued(descriptor("b", 300, "video/mp4"));
        state.items = vec![a, b];
        state.recompute();
        assert_eq!(state.overall_percent, 25);
    }

    #[test]
    fn validation_rejects_oversized_file() {
        let config = UploadConfig::default();
        let batch = vec![descriptor("a", config.max_file_size + 1, "video/mp4")];
        assert!(matches!(
            validate_batch(&batch, std::iter::empty(), &config),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn validation_accepts_file_exactly_at_the_size_limit() {
        let config = UploadConfig::default();
        let batch = vec![descriptor("a", config.max_file_size, "video/mp4")];
        assert!(validate_batch(&batch, std::iter::empty(), &config).is_ok());
    }

    #[test]
    fn validation_rejects_non_media_mime() {
        let config = UploadConfig::default();
        let batch = vec![descriptor("a", 10, "application/pdf")];
        assert!(matches!(
            validate_batch(&batch, std::iter::empty(), &config),
            Err(ValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn validation_rejects_oversized_batch() {
        let config = UploadConfig::default();
        let batch: Vec<_> = (0..config.max_files_per_batch + 1)
            .map(|i| descriptor(&format!("f{i}"), 10, "image/png"))
            .collect();
        assert!(matches!(
            validate_batch(&batch, std::iter::empty(), &config),
            Err(ValidationError::TooManyFiles { .. })
        ));
    }

    #[test]
    fn validation_rejects_duplicates_against_existing_items() {
        let config = UploadConfig::default();
        let batch = vec![descriptor("a", 10, "image/png")];
        let existing = ["a"];
        assert_eq!(
            validate_batch(&batch, existing.iter().copied(), &config),
            Err(ValidationError::Duplicate {
                id: "a".to_string()
            })
        );
    }

    #[test]
    fn validation_accepts_media_batch() {
        let config = UploadConfig::default();
        let batch = vec![
            descriptor("a", 10, "image/png"),
            descriptor("b", 20, "video/mp4"),
        ];
        assert!(validate_batch(&batch, std::iter::empty(), &config).is_ok());
    }
}
