//! Broadcast channel for pushing upload events to subscribers (SSE, tests).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::types::{HistoryEntry, UploadStatus};

/// Events emitted by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    ItemStatusChanged {
        id: String,
        status: UploadStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ItemProgress {
        id: String,
        uploaded_bytes: u64,
        total_bytes: u64,
        percent: u8,
    },
    StateUpdated {
        overall_percent: u8,
        item_count: usize,
    },
    HistoryAdded {
        entry: HistoryEntry,
    },
}

impl Event {
    /// Stable name for subscribers that dispatch on event type (SSE `event`
    /// field).
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ItemStatusChanged { .. } => "item-status",
            Event::ItemProgress { .. } => "item-progress",
            Event::StateUpdated { .. } => "state",
            Event::HistoryAdded { .. } => "history",
        }
    }
}

/// Fan-out sender for [`Event`]s.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Broadcast an event; returns the number of receivers reached. An empty
    /// subscriber list is normal for a headless run.
    pub fn broadcast(&self, event: Event) -> usize {
        trace!(target: "events", event = ?event, "Broadcasting event");
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                debug!(target: "events", "No active subscribers");
                0
            }
        }
    }

    pub fn item_status_changed(&self, id: &str, status: UploadStatus, error: Option<String>) {
        self.broadcast(Event::ItemStatusChanged {
            id: id.to_string(),
            status,
            error,
        });
    }

    pub fn item_progress(&self, id: &str, uploaded_bytes: u64, total_bytes: u64, percent: u8) {
        self.broadcast(Event::ItemProgress {
            id: id.to_string(),
            uploaded_bytes,
            total_bytes,
            percent,
        });
    }

    pub fn state_updated(&self, overall_percent: u8, item_count: usize) {
        self.broadcast(Event::StateUpdated {
            overall_percent,
            item_count,
        });
    }

    pub fn history_added(&self, entry: HistoryEntry) {
        self.broadcast(Event::HistoryAdded { entry });
    }
}
