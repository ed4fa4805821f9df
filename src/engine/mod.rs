//! Per-file upload engine.
//!
//! The engine owns a map of descriptor id to [`Session`] and schedules chunk
//! transfers across all sessions under one global concurrency cap. Chunks
//! start in ascending index order but may complete out of order; every state
//! mutation happens under the session map lock, between suspension points.

mod error;
mod session;

pub use error::{UploadError, UploadResult};
pub use session::{Session, SessionRuntime, SessionStatus, chunk_count};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::{BlobError, BlobReader, BlobStat};
use crate::client::{ApiError, ChunkRequest, FinalizeRequest, InitiateRequest, UploadApi};
use crate::config::UploadConfig;
use crate::hasher::hash_blob;
use crate::store::SessionStore;
use crate::types::{FileDescriptor, UploadStatus};

/// Callbacks the engine reports through. Injected by the owner so the engine
/// never reaches back into coordinator state.
#[async_trait]
pub trait UploadEvents: Send + Sync {
    async fn on_progress(&self, id: &str, uploaded_bytes: u64, total_bytes: u64);
    async fn on_status_change(&self, id: &str, status: UploadStatus, error: Option<String>);
}

/// Chunk scheduler and per-file state machine.
pub struct UploadEngine {
    api: Arc<dyn UploadApi>,
    blobs: Arc<dyn BlobReader>,
    store: Arc<SessionStore>,
    events: Arc<dyn UploadEvents>,
    config: UploadConfig,
    sessions: Mutex<HashMap<String, Session>>,
    /// Global cap on chunks in flight; workers hold owned permits.
    chunk_slots: Arc<Semaphore>,
    /// Woken whenever a worker releases its slot or a session is paused or
    /// cancelled, so schedulers rescan.
    slot_released: Notify,
}

impl UploadEngine {
    pub fn new(
        api: Arc<dyn UploadApi>,
        blobs: Arc<dyn BlobReader>,
        store: Arc<SessionStore>,
        events: Arc<dyn UploadEvents>,
        config: UploadConfig,
    ) -> Arc<Self> {
        let max_chunks = config.max_concurrent_chunks.max(1);
        Arc::new(Self {
            api,
            blobs,
            store,
            events,
            config,
            sessions: Mutex::new(HashMap::new()),
            chunk_slots: Arc::new(Semaphore::new(max_chunks)),
            slot_released: Notify::new(),
        })
    }

    /// Begin uploading a file. Idempotent: a descriptor id that already has
    /// a session is left untouched.
    pub async fn start(
        self: &Arc<Self>,
        source_ref: &str,
        descriptor: &FileDescriptor,
    ) -> UploadResult<()> {
        if self.sessions.lock().await.contains_key(&descriptor.id) {
            debug!(target: "engine", id = %descriptor.id, "Session already exists, ignoring start");
            return Ok(());
        }

        let stat = self
            .blobs
            .stat(source_ref)
            .await
            .unwrap_or(BlobStat::default());
        if !stat.exists || stat.size == 0 {
            warn!(
                target: "engine",
                id = %descriptor.id,
                source_ref,
                "Source unreadable at start"
            );
            self.events
                .on_status_change(&descriptor.id, UploadStatus::Error, Some("source missing".to_string()))
                .await;
            return Err(UploadError::SourceMissing);
        }

        // The blob is authoritative for chunk math; the descriptor size may
        // be stale by the time the upload starts.
        let mut descriptor = descriptor.clone();
        descriptor.size = stat.size;
        let id = descriptor.id.clone();
        let session = Session::new(descriptor, source_ref, self.config.chunk_size);
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&id) {
                return Ok(());
            }
            sessions.insert(id.clone(), session);
        }
        info!(target: "engine", id = %id, size = stat.size, "Upload session installed");
        self.events
            .on_status_change(&id, UploadStatus::Uploading, None)
            .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_to_completion(&id, true).await;
        });
        Ok(())
    }

    /// Pause a session: abort in-flight chunks and stop scheduling. Aborted
    /// chunks stay pending and are re-uploaded on resume.
    pub async fn pause(&self, id: &str) {
        let tokens = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            if session.runtime.is_paused {
                return;
            }
            session.runtime.is_paused = true;
            session.status = SessionStatus::Paused;
            session
                .runtime
                .chunk_aborts
                .values()
                .cloned()
                .collect::<Vec<_>>()
        };
        for token in &tokens {
            token.cancel();
        }
        info!(target: "engine", id, aborted = tokens.len(), "Upload paused");
        self.events
            .on_status_change(id, UploadStatus::Paused, None)
            .await;
        self.slot_released.notify_waiters();
        self.persist_sessions().await;
    }

    /// Resume a paused session. No-op unless the session is actually paused.
    pub async fn resume(self: &Arc<Self>, id: &str) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            if !session.runtime.is_paused {
                return;
            }
            session.runtime.is_paused = false;
            session.runtime.failed = false;
            session.status = SessionStatus::Uploading;
        }
        info!(target: "engine", id, "Upload resumed");
        self.events
            .on_status_change(id, UploadStatus::Uploading, None)
            .await;
        self.persist_sessions().await;

        let engine = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            engine.run_to_completion(&id, false).await;
        });
    }

    /// Cancel a session: abort in-flight chunks, delete the session, and
    /// persist the removal. Each aborted worker releases its own slot.
    pub async fn cancel(&self, id: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(id)
        };
        let Some(mut session) = removed else {
            return;
        };
        session.runtime.is_cancelled = true;
        for token in session.runtime.chunk_aborts.values() {
            token.cancel();
        }
        info!(target: "engine", id, "Upload cancelled");
        self.slot_released.notify_waiters();
        self.persist_sessions().await;
    }

    /// Tear a session down ahead of a user-initiated retry; the owner calls
    /// `start` again afterwards.
    pub async fn reset(&self, id: &str) {
        self.cancel(id).await;
    }

    /// Reload persisted sessions. Sessions whose blob is still reachable are
    /// re-installed with a clean runtime; those persisted as uploading resume
    /// immediately, the rest surface as paused. Unreachable blobs are
    /// silently dropped.
    pub async fn restore_sessions(self: &Arc<Self>) {
        let persisted = self.store.load_sessions().await;
        if persisted.is_empty() {
            return;
        }
        info!(target: "engine", count = persisted.len(), "Restoring persisted sessions");

        for (id, mut session) in persisted {
            if self.sessions.lock().await.contains_key(&id) {
                continue;
            }
            let stat = self
                .blobs
                .stat(&session.source_ref)
                .await
                .unwrap_or(BlobStat::default());
            if !stat.exists {
                debug!(target: "engine", id = %id, "Dropping restored session with missing source");
                continue;
            }

            session.runtime = SessionRuntime {
                is_paused: session.status == SessionStatus::Paused,
                ..SessionRuntime::default()
            };
            let resume_now = session.status == SessionStatus::Uploading;
            self.sessions.lock().await.insert(id.clone(), session);

            if resume_now {
                self.events
                    .on_status_change(&id, UploadStatus::Uploading, None)
                    .await;
                let engine = Arc::clone(self);
                let id = id.clone();
                tokio::spawn(async move {
                    engine.run_to_completion(&id, false).await;
                });
            } else {
                self.events
                    .on_status_change(&id, UploadStatus::Paused, None)
                    .await;
            }
        }
        self.persist_sessions().await;
    }

    /// Whether a session exists for the id.
    pub async fn has_session(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Snapshot a session for inspection.
    pub async fn session_snapshot(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Free chunk slots (capacity minus in-flight chunks).
    pub fn available_chunk_slots(&self) -> usize {
        self.chunk_slots.available_permits()
    }

    /// Query the server-side view of a session. `None` when there is no
    /// session or it has not been negotiated with the server yet.
    pub async fn remote_status(
        &self,
        id: &str,
    ) -> Option<Result<crate::client::StatusResponse, ApiError>> {
        let upload_id = {
            let sessions = self.sessions.lock().await;
            sessions.get(id).map(|session| session.server_upload_id.clone())
        }?;
        if upload_id.is_empty() {
            return None;
        }
        Some(self.api.status(&upload_id).await)
    }

    /// Run a session to a terminal outcome, reporting failures through the
    /// status callback. `negotiate` selects the fresh path (hash + initiate)
    /// over the restore path that reuses the persisted server session.
    async fn run_to_completion(self: &Arc<Self>, id: &str, negotiate: bool) {
        let result = if negotiate {
            self.negotiate_and_transfer(id).await
        } else {
            self.transfer_and_finalize(id).await
        };
        match result {
            Ok(()) => {}
            Err(UploadError::Cancelled) => {
                debug!(target: "engine", id, "Upload stopped by pause or cancel");
            }
            Err(err) => {
                error!(target: "engine", id, error = %err, "Upload failed");
                self.events
                    .on_status_change(id, UploadStatus::Error, Some(err.to_string()))
                    .await;
            }
        }
    }

    async fn negotiate_and_transfer(self: &Arc<Self>, id: &str) -> UploadResult<()> {
        let (source_ref, size) = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(id).ok_or(UploadError::Cancelled)?;
            (session.source_ref.clone(), session.descriptor.size)
        };

        let hash = hash_blob(self.blobs.as_ref(), &source_ref)
            .await
            .map_err(|err| UploadError::HashFailed(err.0))?;
        debug!(target: "engine", id, %hash, "Source fingerprinted");

        let request = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(id).ok_or(UploadError::Cancelled)?;
            session.file_hash = Some(hash.clone());
            InitiateRequest {
                file_name: session.descriptor.name.clone(),
                file_size: session.descriptor.size,
                mime_type: session.descriptor.mime_type.clone(),
                file_hash: hash,
            }
        };

        let response = self.api.initiate(&request).await.map_err(UploadError::from)?;
        if response.is_dedup_hit() {
            info!(
                target: "engine",
                id,
                file_id = response.file_id.as_deref().unwrap_or_default(),
                "Server already stores this file"
            );
            self.remove_session(id).await;
            self.events.on_progress(id, size, size).await;
            self.events
                .on_status_change(id, UploadStatus::Completed, None)
                .await;
            return Ok(());
        }

        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(id).ok_or(UploadError::Cancelled)?;
            session.apply_server_geometry(
                &response.upload_id,
                response.chunk_size,
                response.total_chunks,
            );
            debug!(
                target: "engine",
                id,
                upload_id = %session.server_upload_id,
                chunk_size = session.chunk_size,
                total_chunks = session.total_chunks,
                "Upload session negotiated"
            );
        }
        self.persist_sessions().await;

        self.transfer_and_finalize(id).await
    }

    /// Scheduler loop: scan chunk indices in order, spawn a worker per free
    /// slot, finalize once everything is uploaded.
    async fn transfer_and_finalize(self: &Arc<Self>, id: &str) -> UploadResult<()> {
        enum Step {
            Stop,
            Wait,
            Finalize,
            Spawn(usize),
        }

        loop {
            // Register interest before inspecting state so a slot released
            // in between still wakes the scan.
            let notified = self.slot_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let sessions = self.sessions.lock().await;
                let Some(session) = sessions.get(id) else {
                    return Err(UploadError::Cancelled);
                };
                if session.runtime.is_paused || session.runtime.failed {
                    Step::Stop
                } else if session.all_chunks_uploaded() {
                    if session.runtime.active_chunks.is_empty() {
                        Step::Finalize
                    } else {
                        Step::Wait
                    }
                } else if let Some(index) = session.next_pending_chunk() {
                    Step::Spawn(index)
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Stop => return Ok(()),
                Step::Finalize => return self.finalize(id).await,
                Step::Wait => notified.await,
                Step::Spawn(index) => {
                    let Ok(permit) = Arc::clone(&self.chunk_slots).try_acquire_owned() else {
                        notified.await;
                        continue;
                    };
                    let registered = {
                        let mut sessions = self.sessions.lock().await;
                        match sessions.get_mut(id) {
                            Some(session)
                                if !session.runtime.is_paused && !session.runtime.failed =>
                            {
                                session.runtime.active_chunks.insert(index)
                            }
                            _ => false,
                        }
                    };
                    if !registered {
                        drop(permit);
                        continue;
                    }
                    debug!(target: "engine::chunk", id, chunk = index, "Chunk worker spawned");
                    let engine = Arc::clone(self);
                    let id = id.to_string();
                    tokio::spawn(async move {
                        engine.run_chunk_worker(&id, index).await;
                        drop(permit);
                        engine.slot_released.notify_waiters();
                    });
                }
            }
        }
    }

    async fn run_chunk_worker(self: &Arc<Self>, id: &str, index: usize) {
        match self.upload_chunk_with_retry(id, index).await {
            Ok(()) => {}
            Err(UploadError::Cancelled) => {
                debug!(target: "engine::chunk", id, chunk = index, "Chunk aborted");
            }
            Err(err) => {
                error!(
                    target: "engine::chunk",
                    id,
                    chunk = index,
                    error = %err,
                    "Chunk failed after retries"
                );
                {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(session) = sessions.get_mut(id) {
                        session.runtime.failed = true;
                    }
                }
                self.events
                    .on_status_change(id, UploadStatus::Error, Some(err.to_string()))
                    .await;
            }
        }
    }

    async fn upload_chunk_with_retry(self: &Arc<Self>, id: &str, index: usize) -> UploadResult<()> {
        let mut attempt: u32 = 0;
        loop {
            // Fresh abort token per attempt; a stale attempt must never be
            // able to clear a newer attempt's registration.
            let token = Arc::new(CancellationToken::new());
            {
                let mut sessions = self.sessions.lock().await;
                let Some(session) = sessions.get_mut(id) else {
                    return Err(UploadError::Cancelled);
                };
                if session.runtime.is_paused || session.runtime.is_cancelled {
                    session.runtime.active_chunks.remove(&index);
                    return Err(UploadError::Cancelled);
                }
                session
                    .runtime
                    .chunk_aborts
                    .insert(index, Arc::clone(&token));
            }

            match self.try_upload_chunk(id, index, &token).await {
                Ok(len) => {
                    self.complete_chunk(id, index, len, &token).await;
                    return Ok(());
                }
                Err(err @ UploadError::Cancelled) => {
                    self.release_chunk(id, index, &token).await;
                    return Err(err);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.initial_retry_delay * 2u32.saturating_pow(attempt);
                    warn!(
                        target: "engine::chunk",
                        id,
                        chunk = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Chunk failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            self.release_chunk(id, index, &token).await;
                            return Err(UploadError::Cancelled);
                        }
                    }
                    // Recheck pause/cancel after the backoff sleep.
                    let keep_going = {
                        let sessions = self.sessions.lock().await;
                        sessions
                            .get(id)
                            .is_some_and(|s| !s.runtime.is_paused && !s.runtime.is_cancelled)
                    };
                    if !keep_going {
                        self.release_chunk(id, index, &token).await;
                        return Err(UploadError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.release_chunk(id, index, &token).await;
                    return Err(err);
                }
            }
        }
    }

    /// Upload one chunk attempt: slice the cached bytes (reading the blob on
    /// first use), base64-encode, and post.
    async fn try_upload_chunk(
        &self,
        id: &str,
        index: usize,
        token: &CancellationToken,
    ) -> UploadResult<u64> {
        let needs_read = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(id).ok_or(UploadError::Cancelled)?;
            session
                .runtime
                .cached_bytes
                .is_none()
                .then(|| session.source_ref.clone())
        };
        if let Some(source_ref) = needs_read {
            let data = self.blobs.read_all(&source_ref).await.map_err(|err| match err {
                BlobError::SourceMissing(_) => UploadError::SourceMissing,
                BlobError::Read { .. } => UploadError::SourceMissing,
            })?;
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(id) {
                session.runtime.cached_bytes.get_or_insert(data);
            }
        }

        let (request, len) = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(id).ok_or(UploadError::Cancelled)?;
            let cached = session
                .runtime
                .cached_bytes
                .as_ref()
                .ok_or(UploadError::Cancelled)?;
            let (start, end) = session.chunk_range(index);
            if start >= cached.len() as u64 {
                return Err(UploadError::SourceMissing);
            }
            let end = end.min(cached.len() as u64);
            let slice = cached.slice(start as usize..end as usize);
            (
                ChunkRequest {
                    upload_id: session.server_upload_id.clone(),
                    chunk_index: index,
                    chunk_data: BASE64.encode(&slice),
                },
                end - start,
            )
        };

        let response = self.api.upload_chunk(&request, token).await?;
        if !response.success {
            return Err(UploadError::Api(ApiError::Server {
                status: 200,
                message: format!("chunk {index} rejected by server"),
            }));
        }
        Ok(len)
    }

    /// Record a successful chunk and report progress.
    async fn complete_chunk(&self, id: &str, index: usize, len: u64, token: &Arc<CancellationToken>) {
        let progress = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            session.runtime.active_chunks.remove(&index);
            remove_if_same_token(session, index, token);
            session.mark_uploaded(index);
            debug!(
                target: "engine::chunk",
                id,
                chunk = index,
                bytes = len,
                uploaded = session.uploaded_chunks.len(),
                total = session.total_chunks,
                "Chunk uploaded"
            );
            (
                session.uploaded_bytes.min(session.descriptor.size),
                session.descriptor.size,
            )
        };
        self.events.on_progress(id, progress.0, progress.1).await;
        self.persist_sessions().await;
    }

    /// Drop a chunk's registration without marking it uploaded.
    async fn release_chunk(&self, id: &str, index: usize, token: &Arc<CancellationToken>) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        session.runtime.active_chunks.remove(&index);
        remove_if_same_token(session, index, token);
    }

    async fn finalize(self: &Arc<Self>, id: &str) -> UploadResult<()> {
        let (upload_id, size) = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(id).ok_or(UploadError::Cancelled)?;
            (session.server_upload_id.clone(), session.descriptor.size)
        };
        debug!(target: "engine", id, %upload_id, "Finalizing upload");

        // A finalize failure keeps the session (and its uploaded chunks) so
        // a retry does not restart from chunk zero.
        let response = self
            .api
            .finalize(&FinalizeRequest { upload_id })
            .await
            .map_err(UploadError::from)?;

        info!(target: "engine", id, file_id = %response.file_id, "Upload finalized");
        self.remove_session(id).await;
        self.events.on_progress(id, size, size).await;
        self.events
            .on_status_change(id, UploadStatus::Completed, None)
            .await;
        Ok(())
    }

    async fn remove_session(&self, id: &str) {
        self.sessions.lock().await.remove(id);
        self.persist_sessions().await;
    }

    /// Mirror the in-memory session map to the store (debounced there).
    async fn persist_sessions(&self) {
        let snapshot = self.sessions.lock().await.clone();
        self.store.save_sessions(snapshot).await;
    }
}

/// Remove the abort-map entry only when it is the very token this attempt
/// registered; a newer retry's token must survive a stale cleanup.
fn remove_if_same_token(session: &mut Session, index: usize, token: &Arc<CancellationToken>) {
    if session
        .runtime
        .chunk_aborts
        .get(&index)
        .is_some_and(|current| Arc::ptr_eq(current, token))
    {
        session.runtime.chunk_aborts.remove(&index);
    }
}
