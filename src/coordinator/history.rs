//! Completion history sink.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::events::EventBroadcaster;
use crate::store::SessionStore;
use crate::types::HistoryEntry;

/// Receives one entry per finished upload. External to the coordinator; the
/// default implementation persists and broadcasts.
#[async_trait]
pub trait HistoryEmitter: Send + Sync {
    async fn emit(&self, entry: HistoryEntry);
}

/// Store-backed emitter: prepends to the persisted history (newest first)
/// and fans the addition out to event subscribers.
pub struct StoreHistoryEmitter {
    store: Arc<SessionStore>,
    events: EventBroadcaster,
}

impl StoreHistoryEmitter {
    pub fn new(store: Arc<SessionStore>, events: EventBroadcaster) -> Arc<Self> {
        Arc::new(Self { store, events })
    }
}

#[async_trait]
impl HistoryEmitter for StoreHistoryEmitter {
    async fn emit(&self, entry: HistoryEntry) {
        info!(
            target: "coordinator",
            id = %entry.id,
            name = %entry.name,
            "Upload recorded in history"
        );
        self.store.push_history(entry.clone()).await;
        self.events.history_added(entry);
    }
}
