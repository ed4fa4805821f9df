//! Trailing-edge debounced JSON documents.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// A JSON file whose writes are coalesced on a trailing timer.
///
/// `save` replaces the pending value and restarts the timer, so within one
/// debounce window the last value wins. `flush` writes any pending value
/// immediately. Failed writes are logged and swallowed; persistence is never
/// allowed onto the critical path.
pub(crate) struct DebouncedDocument<T> {
    path: PathBuf,
    delay: Duration,
    slot: Arc<Mutex<Option<T>>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Serialize + Send + Sync + 'static> DebouncedDocument<T> {
    pub fn new(path: PathBuf, delay: Duration) -> Self {
        Self {
            path,
            delay,
            slot: Arc::new(Mutex::new(None)),
            pending: Mutex::new(None),
        }
    }

    pub async fn save(&self, value: T) {
        *self.slot.lock().await = Some(value);

        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let slot = Arc::clone(&self.slot);
        let path = self.path.clone();
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut slot = slot.lock().await;
            if let Some(value) = slot.as_ref() {
                write_json(&path, value).await;
            }
            // Cleared only after the write finished; an aborted write leaves
            // the value for the next flush.
            *slot = None;
        }));
    }

    pub async fn flush(&self) {
        if let Some(handle) = self.pending.lock().await.take() {
            handle.abort();
        }
        let mut slot = self.slot.lock().await;
        if let Some(value) = slot.as_ref() {
            write_json(&self.path, value).await;
        }
        *slot = None;
    }

    /// Drop any pending value and delete the backing file.
    pub async fn clear(&self) {
        if let Some(handle) = self.pending.lock().await.take() {
            handle.abort();
        }
        *self.slot.lock().await = None;
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "store", path = %self.path.display(), error = %err, "Failed to remove document");
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Serialize and write, logging failures instead of propagating them.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(err) => {
            warn!(target: "store", path = %path.display(), error = %err, "Failed to serialize document");
            return;
        }
    };
    if let Err(err) = tokio::fs::write(path, json).await {
        warn!(target: "store", path = %path.display(), error = %err, "Failed to write document");
    }
}

/// Read and deserialize, returning `None` (with a log line) on any failure.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "store", path = %path.display(), error = %err, "Failed to read document");
            }
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target: "store", path = %path.display(), error = %err, "Failed to parse document");
            None
        }
    }
}
