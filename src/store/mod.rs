//! Durable persistence of upload state.
//!
//! Four JSON documents live under the state directory: the session map, the
//! aggregate item state, the source-ref map, and the completion history.
//! Session/aggregate/ref writes are debounced on a trailing timer; loads are
//! synchronous-on-demand. Storage failures are logged and swallowed — the
//! engine stays authoritative on in-memory state.

mod debounce;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::engine::Session;
use crate::types::{AggregateState, HistoryEntry, UploadItem, UploadStatus};
use debounce::{DebouncedDocument, read_json, write_json};

const SESSIONS_FILE: &str = "upload_sessions.json";
const AGGREGATE_FILE: &str = "upload_state.json";
const SOURCE_REFS_FILE: &str = "upload_source_refs.json";
const HISTORY_FILE: &str = "upload_history.json";

/// Aggregate state as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAggregate {
    pub items: Vec<UploadItem>,
    pub overall_percent: u8,
    pub timestamp: i64,
}

/// Key-value persistence for upload state.
pub struct SessionStore {
    sessions: DebouncedDocument<HashMap<String, Session>>,
    aggregate: DebouncedDocument<PersistedAggregate>,
    source_refs: DebouncedDocument<HashMap<String, String>>,
    history_path: PathBuf,
    /// Serializes the read-modify-write cycle on the history document.
    history_lock: Mutex<()>,
    session_expiry_secs: i64,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, config: &UploadConfig) -> Self {
        let dir = dir.into();
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!(target: "store", dir = %dir.display(), error = %err, "Failed to create state directory");
        }
        let delay = config.persistence_debounce;
        Self {
            sessions: DebouncedDocument::new(dir.join(SESSIONS_FILE), delay),
            aggregate: DebouncedDocument::new(dir.join(AGGREGATE_FILE), delay),
            source_refs: DebouncedDocument::new(dir.join(SOURCE_REFS_FILE), delay),
            history_path: dir.join(HISTORY_FILE),
            history_lock: Mutex::new(()),
            session_expiry_secs: config.session_expiry.as_secs() as i64,
        }
    }

    /// Replace the persisted session map (debounced, full snapshot).
    pub async fn save_sessions(&self, sessions: HashMap<String, Session>) {
        self.sessions.save(sessions).await;
    }

    /// Load the persisted session map, dropping records older than the
    /// expiry and writing the cleaned map back when anything was dropped.
    pub async fn load_sessions(&self) -> HashMap<String, Session> {
        let Some(mut sessions) =
            read_json::<HashMap<String, Session>>(self.sessions.path()).await
        else {
            return HashMap::new();
        };

        let now = Utc::now().timestamp();
        let before = sessions.len();
        sessions.retain(|_, session| now - session.created_at < self.session_expiry_secs);
        let dropped = before - sessions.len();
        if dropped > 0 {
            info!(target: "store", dropped, "Dropped expired upload sessions");
            write_json(self.sessions.path(), &sessions).await;
        }
        sessions
    }

    /// Persist the aggregate minus completed/idle items (debounced).
    pub async fn save_aggregate(&self, state: &AggregateState) {
        let items: Vec<UploadItem> = state
            .items
            .iter()
            .filter(|item| {
                !matches!(item.status, UploadStatus::Completed | UploadStatus::Idle)
            })
            .cloned()
            .collect();
        self.aggregate
            .save(PersistedAggregate {
                items,
                overall_percent: state.overall_percent,
                timestamp: Utc::now().timestamp_millis(),
            })
            .await;
    }

    pub async fn load_aggregate(&self) -> Option<AggregateState> {
        let persisted = read_json::<PersistedAggregate>(self.aggregate.path()).await?;
        Some(AggregateState {
            items: persisted.items,
            overall_percent: persisted.overall_percent,
        })
    }

    pub async fn save_source_refs(&self, refs: HashMap<String, String>) {
        self.source_refs.save(refs).await;
    }

    pub async fn load_source_refs(&self) -> HashMap<String, String> {
        read_json(self.source_refs.path()).await.unwrap_or_default()
    }

    /// Prepend an entry to the completion history (newest first). History
    /// writes are small and rare, so they are not debounced.
    pub async fn push_history(&self, entry: HistoryEntry) {
        let _guard = self.history_lock.lock().await;
        let mut history: Vec<HistoryEntry> =
            read_json(&self.history_path).await.unwrap_or_default();
        history.retain(|existing| existing.id != entry.id);
        history.insert(0, entry);
        write_json(&self.history_path, &history).await;
    }

    pub async fn load_history(&self) -> Vec<HistoryEntry> {
        read_json(&self.history_path).await.unwrap_or_default()
    }

    pub async fn clear_sessions(&self) {
        self.sessions.clear().await;
    }

    pub async fn clear_aggregate(&self) {
        self.aggregate.clear().await;
    }

    pub async fn clear_source_refs(&self) {
        self.source_refs.clear().await;
    }

    pub async fn clear_history(&self) {
        let _guard = self.history_lock.lock().await;
        if let Err(err) = tokio::fs::remove_file(&self.history_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "store", error = %err, "Failed to clear history");
            }
        }
    }

    /// Write all pending debounced documents immediately.
    pub async fn flush(&self) {
        debug!(target: "store", "Flushing pending documents");
        self.sessions.flush().await;
        self.aggregate.flush().await;
        self.source_refs.flush().await;
    }
}
