//! Process-wide upload coordination.
//!
//! The coordinator owns the observable aggregate of upload items and the
//! id-to-source-ref map, exposes the control surface consumed by hosts, and
//! wires a single [`UploadEngine`] with callbacks. Engine callbacks update
//! items; every aggregate change wakes the auto-start scan, feeds the
//! history sink, and schedules a persisted snapshot.

mod history;
mod lifecycle;

pub use history::{HistoryEmitter, StoreHistoryEmitter};
pub use lifecycle::{ChannelLifecycleSource, LifecycleEvent, LifecycleSource};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blob::BlobReader;
use crate::client::UploadApi;
use crate::config::UploadConfig;
use crate::engine::{UploadEngine, UploadEvents};
use crate::events::EventBroadcaster;
use crate::store::SessionStore;
use crate::types::{
    AggregateState, FileDescriptor, HistoryEntry, Progress, UploadItem, UploadStatus,
    ValidationError, validate_batch,
};

#[derive(Default)]
struct CoordState {
    items: Vec<UploadItem>,
    source_refs: HashMap<String, String>,
    /// Ids handed to the engine; prevents double-starting a queued item
    /// before its `uploading` callback lands.
    started: HashSet<String>,
    history_seen: HashSet<String>,
}

impl CoordState {
    fn item(&self, id: &str) -> Option<&UploadItem> {
        self.items.iter().find(|item| item.file.id == id)
    }

    fn item_mut(&mut self, id: &str) -> Option<&mut UploadItem> {
        self.items.iter_mut().find(|item| item.file.id == id)
    }
}

/// State shared between the coordinator, the engine callback bridge, and the
/// auto-start loop.
struct Shared {
    state: Mutex<CoordState>,
    store: Arc<SessionStore>,
    events: EventBroadcaster,
    history: Arc<dyn HistoryEmitter>,
    progress_debouncers: DashMap<String, JoinHandle<()>>,
    progress_debounce: Duration,
    /// Woken on every aggregate change; drives the auto-start scan.
    state_changed: Notify,
}

impl Shared {
    async fn apply_progress(&self, id: &str, uploaded_bytes: u64, total_bytes: u64) {
        {
            let mut state = self.state.lock().await;
            let Some(item) = state.item_mut(id) else {
                return;
            };
            // Terminal items accept no further progress.
            if item.status == UploadStatus::Completed {
                return;
            }
            item.progress = Progress::new(uploaded_bytes, total_bytes);
            let progress = item.progress;
            self.events
                .item_progress(id, progress.uploaded_bytes, progress.total_bytes, progress.percent);
        }
        self.touch().await;
    }

    async fn apply_status(&self, id: &str, status: UploadStatus, error: Option<String>) {
        let changed = {
            let mut state = self.state.lock().await;
            let Some(item) = state.item_mut(id) else {
                return;
            };
            // Completed is terminal, and consecutive identical statuses
            // collapse into a single observable event.
            if item.status == UploadStatus::Completed
                || (item.status == status && item.error_message == error)
            {
                false
            } else {
                item.status = status;
                item.error_message = error.clone();
                if status == UploadStatus::Completed {
                    // The final progress callback may have been debounced
                    // away; force the full bar before anyone observes the
                    // completed status.
                    item.progress = Progress::complete(item.progress.total_bytes.max(item.file.size));
                }
                true
            }
        };
        if changed {
            debug!(target: "coordinator", id, status = status.as_str(), "Item status changed");
            self.events.item_status_changed(id, status, error);
            self.touch().await;
        }
    }

    /// Post-change bookkeeping: aggregate recompute and broadcast, history
    /// emission, persisted snapshot, auto-start wakeup.
    async fn touch(&self) {
        let (aggregate, new_history) = {
            let mut state = self.state.lock().await;
            let mut aggregate = AggregateState {
                items: state.items.clone(),
                overall_percent: 0,
            };
            aggregate.recompute();

            let candidates: Vec<HistoryEntry> = state
                .items
                .iter()
                .filter(|item| {
                    item.status == UploadStatus::Completed
                        && item.progress.total_bytes > 0
                        && (item.progress.percent >= 99
                            || item.progress.uploaded_bytes >= item.progress.total_bytes)
                        && !state.history_seen.contains(&item.file.id)
                })
                .map(|item| HistoryEntry {
                    id: item.file.id.clone(),
                    name: item.file.name.clone(),
                    size: item.file.size,
                    mime_type: item.file.mime_type.clone(),
                    completed_at: Utc::now().to_rfc3339(),
                })
                .collect();
            for entry in &candidates {
                state.history_seen.insert(entry.id.clone());
            }
            (aggregate, candidates)
        };

        self.events
            .state_updated(aggregate.overall_percent, aggregate.items.len());
        for entry in new_history {
            self.history.emit(entry).await;
        }
        self.store.save_aggregate(&aggregate).await;
        self.state_changed.notify_one();
    }
}

/// Engine-to-coordinator callback bridge. Holds only the shared state, never
/// the coordinator itself, so ownership stays acyclic.
struct EngineBridge {
    shared: Arc<Shared>,
}

#[async_trait]
impl UploadEvents for EngineBridge {
    async fn on_progress(&self, id: &str, uploaded_bytes: u64, total_bytes: u64) {
        // Trailing-edge debounce per id; the newest update wins the window.
        let shared = Arc::clone(&self.shared);
        let id_owned = id.to_string();
        let delay = shared.progress_debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.apply_progress(&id_owned, uploaded_bytes, total_bytes).await;
        });
        if let Some(previous) = self.shared.progress_debouncers.insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    async fn on_status_change(&self, id: &str, status: UploadStatus, error: Option<String>) {
        // A status transition outranks any pending debounced progress.
        if let Some((_, previous)) = self.shared.progress_debouncers.remove(id) {
            previous.abort();
        }
        self.shared.apply_status(id, status, error).await;
    }
}

/// Controller and state aggregator for all uploads in the process.
pub struct Coordinator {
    shared: Arc<Shared>,
    engine: Arc<UploadEngine>,
    config: UploadConfig,
}

impl Coordinator {
    pub fn new(
        api: Arc<dyn UploadApi>,
        blobs: Arc<dyn BlobReader>,
        store: Arc<SessionStore>,
        events: EventBroadcaster,
        history: Arc<dyn HistoryEmitter>,
        config: UploadConfig,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordState::default()),
            store: Arc::clone(&store),
            events,
            history,
            progress_debouncers: DashMap::new(),
            progress_debounce: config.progress_debounce,
            state_changed: Notify::new(),
        });
        let bridge = Arc::new(EngineBridge {
            shared: Arc::clone(&shared),
        });
        let engine = UploadEngine::new(api, blobs, store, bridge, config.clone());

        let coordinator = Arc::new(Self {
            shared,
            engine,
            config,
        });
        coordinator.spawn_auto_start();
        coordinator
    }

    /// Load persisted aggregate state and source refs. Must run before any
    /// enqueue so the auto-start scan sees restored items first.
    pub async fn init(&self) {
        let aggregate = self.shared.store.load_aggregate().await;
        let refs = self.shared.store.load_source_refs().await;
        {
            let mut state = self.shared.state.lock().await;
            if let Some(aggregate) = aggregate {
                info!(
                    target: "coordinator",
                    items = aggregate.items.len(),
                    "Restored aggregate state"
                );
                state.items = aggregate.items;
            }
            state.source_refs.extend(refs);
        }
        self.shared.touch().await;
    }

    /// Append descriptors in `queued` status. The whole batch is validated
    /// up front; on rejection nothing is appended.
    pub async fn enqueue(
        &self,
        descriptors: Vec<FileDescriptor>,
        source_refs: Option<HashMap<String, String>>,
    ) -> Result<(), ValidationError> {
        let (refs_snapshot, enqueued_ids) = {
            let mut state = self.shared.state.lock().await;
            validate_batch(
                &descriptors,
                state.items.iter().map(|item| item.file.id.as_str()),
                &self.config,
            )?;
            if let Some(refs) = source_refs {
                state.source_refs.extend(refs);
            }
            let mut enqueued_ids = Vec::with_capacity(descriptors.len());
            for descriptor in descriptors {
                if let Some(source_ref) = descriptor.source_ref.clone() {
                    state.source_refs.insert(descriptor.id.clone(), source_ref);
                }
                info!(
                    target: "coordinator",
                    id = %descriptor.id,
                    name = %descriptor.name,
                    size = descriptor.size,
                    "Upload enqueued"
                );
                enqueued_ids.push(descriptor.id.clone());
                state.items.push(UploadItem::queued(descriptor));
            }
            (state.source_refs.clone(), enqueued_ids)
        };
        for id in &enqueued_ids {
            self.shared
                .events
                .item_status_changed(id, UploadStatus::Queued, None);
        }
        self.shared.store.save_source_refs(refs_snapshot).await;
        self.shared.touch().await;
        Ok(())
    }

    /// Pause an item. The local status flips immediately; the engine's own
    /// `paused` callback then dedups to a no-op.
    pub async fn pause(&self, id: &str) -> bool {
        if !self.item_exists(id).await {
            return false;
        }
        self.shared.apply_status(id, UploadStatus::Paused, None).await;
        self.engine.pause(id).await;
        true
    }

    pub async fn resume(&self, id: &str) -> bool {
        if !self.item_exists(id).await {
            return false;
        }
        self.engine.resume(id).await;
        true
    }

    /// Cancel and remove an item entirely.
    pub async fn cancel(&self, id: &str) -> bool {
        if !self.item_exists(id).await {
            return false;
        }
        self.engine.cancel(id).await;
        if let Some((_, handle)) = self.shared.progress_debouncers.remove(id) {
            handle.abort();
        }
        let refs_snapshot = {
            let mut state = self.shared.state.lock().await;
            state.items.retain(|item| item.file.id != id);
            state.source_refs.remove(id);
            state.started.remove(id);
            state.source_refs.clone()
        };
        info!(target: "coordinator", id, "Upload cancelled and removed");
        self.shared.store.save_source_refs(refs_snapshot).await;
        self.shared.touch().await;
        true
    }

    /// Tear the item's session down and start over from chunk zero,
    /// counting a user-initiated retry.
    pub async fn retry(&self, id: &str) -> bool {
        let (descriptor, source_ref) = {
            let state = self.shared.state.lock().await;
            let Some(item) = state.item(id) else {
                return false;
            };
            (item.file.clone(), state.source_refs.get(id).cloned())
        };

        self.engine.reset(id).await;
        {
            let mut state = self.shared.state.lock().await;
            if let Some(item) = state.item_mut(id) {
                item.status = UploadStatus::Queued;
                item.retries += 1;
                item.progress = Progress::new(0, item.file.size);
                item.error_message = None;
            }
            // Claimed here so the auto-start scan does not race the explicit
            // start below.
            state.started.insert(id.to_string());
        }
        info!(target: "coordinator", id, "Retrying upload");
        self.shared.events.item_status_changed(id, UploadStatus::Queued, None);
        self.shared.touch().await;

        match source_ref {
            Some(source_ref) => {
                if let Err(err) = self.engine.start(&source_ref, &descriptor).await {
                    warn!(target: "coordinator", id, error = %err, "Retry failed to start");
                    self.shared.state.lock().await.started.remove(id);
                }
            }
            None => {
                self.shared.state.lock().await.started.remove(id);
            }
        }
        true
    }

    /// Remove all completed items and drop their source refs.
    pub async fn clear_completed(&self) -> usize {
        let (removed, refs_snapshot) = {
            let mut state = self.shared.state.lock().await;
            let removed_ids: Vec<String> = state
                .items
                .iter()
                .filter(|item| item.status == UploadStatus::Completed)
                .map(|item| item.file.id.clone())
                .collect();
            state.items.retain(|item| item.status != UploadStatus::Completed);
            for id in &removed_ids {
                state.source_refs.remove(id);
            }
            (removed_ids.len(), state.source_refs.clone())
        };
        if removed > 0 {
            info!(target: "coordinator", removed, "Cleared completed uploads");
            self.shared.store.save_source_refs(refs_snapshot).await;
            self.shared.touch().await;
        }
        removed
    }

    /// Current aggregate snapshot.
    pub async fn aggregate_state(&self) -> AggregateState {
        let state = self.shared.state.lock().await;
        let mut aggregate = AggregateState {
            items: state.items.clone(),
            overall_percent: 0,
        };
        aggregate.recompute();
        aggregate
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.shared.store.load_history().await
    }

    /// Server-side view of an item's in-flight session, when one exists.
    pub async fn remote_status(
        &self,
        id: &str,
    ) -> Option<Result<crate::client::StatusResponse, crate::client::ApiError>> {
        self.engine.remote_status(id).await
    }

    /// Background transition: persist aggregate state and source refs
    /// immediately, bypassing the debounce windows.
    pub async fn on_background(&self) {
        info!(target: "coordinator", "Background transition, flushing state");
        let (aggregate, refs_snapshot) = {
            let state = self.shared.state.lock().await;
            let mut aggregate = AggregateState {
                items: state.items.clone(),
                overall_percent: 0,
            };
            aggregate.recompute();
            (aggregate, state.source_refs.clone())
        };
        self.shared.store.save_aggregate(&aggregate).await;
        self.shared.store.save_source_refs(refs_snapshot).await;
        self.shared.store.flush().await;
    }

    /// Foreground transition: restore persisted sessions, then blind-resume
    /// every uploading/queued item with a known source ref. `resume` refuses
    /// anything that is not actually paused, so restored sessions already
    /// transferring are unaffected.
    pub async fn on_foreground(&self) {
        info!(target: "coordinator", "Foreground transition, restoring sessions");
        self.engine.restore_sessions().await;
        let ids: Vec<String> = {
            let state = self.shared.state.lock().await;
            state
                .items
                .iter()
                .filter(|item| {
                    matches!(item.status, UploadStatus::Uploading | UploadStatus::Queued)
                })
                .filter(|item| state.source_refs.contains_key(&item.file.id))
                .map(|item| item.file.id.clone())
                .collect()
        };
        for id in ids {
            self.engine.resume(&id).await;
        }
    }

    /// Drive lifecycle hooks from an external source.
    pub fn run_lifecycle(self: &Arc<Self>, source: Arc<dyn LifecycleSource>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = source.next_event().await {
                match event {
                    LifecycleEvent::Foreground => coordinator.on_foreground().await,
                    LifecycleEvent::Background => coordinator.on_background().await,
                }
            }
        });
    }

    async fn item_exists(&self, id: &str) -> bool {
        self.shared.state.lock().await.item(id).is_some()
    }

    /// Auto-start loop: whenever the aggregate changes, hand every queued
    /// item with a known source ref to the engine exactly once.
    fn spawn_auto_start(self: &Arc<Self>) {
        let shared = Arc::clone(&self.shared);
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            loop {
                shared.state_changed.notified().await;
                Self::auto_start_pass(&shared, &engine).await;
            }
        });
    }

    async fn auto_start_pass(shared: &Arc<Shared>, engine: &Arc<UploadEngine>) {
        loop {
            let candidates = {
                let mut state = shared.state.lock().await;
                // Evict started markers for ids that left the queued state
                // (or left the aggregate entirely).
                let queued: HashSet<String> = state
                    .items
                    .iter()
                    .filter(|item| item.status == UploadStatus::Queued)
                    .map(|item| item.file.id.clone())
                    .collect();
                state.started.retain(|id| queued.contains(id));

                let candidates: Vec<(FileDescriptor, String)> = state
                    .items
                    .iter()
                    .filter(|item| {
                        item.status == UploadStatus::Queued
                            && !state.started.contains(&item.file.id)
                    })
                    .filter_map(|item| {
                        state
                            .source_refs
                            .get(&item.file.id)
                            .map(|source_ref| (item.file.clone(), source_ref.clone()))
                    })
                    .collect();
                for (descriptor, _) in &candidates {
                    state.started.insert(descriptor.id.clone());
                }
                candidates
            };
            if candidates.is_empty() {
                return;
            }
            for (descriptor, source_ref) in candidates {
                debug!(target: "coordinator", id = %descriptor.id, "Auto-starting queued upload");
                if let Err(err) = engine.start(&source_ref, &descriptor).await {
                    warn!(
                        target: "coordinator",
                        id = %descriptor.id,
                        error = %err,
                        "Auto-start failed"
                    );
                    shared.state.lock().await.started.remove(&descriptor.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
