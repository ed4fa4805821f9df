use super::*;
use crate::blob::{BlobError, BlobStat};
use crate::client::{
    ApiError, ChunkRequest, ChunkResponse, FinalizeRequest, FinalizeResponse, InitiateRequest,
    InitiateResponse, RemoteUploadStatus, StatusResponse,
};
use crate::engine::chunk_count;
use crate::events::Event;
use bytes::Bytes;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

struct MemoryBlobs(HashMap<String, Bytes>);

impl MemoryBlobs {
    fn single(source_ref: &str, len: usize) -> Arc<Self> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Arc::new(Self(HashMap::from([(
            source_ref.to_string(),
            Bytes::from(data),
        )])))
    }
}

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

struct FakeApi {
    chunk_size: u64,
    chunk_failures: StdMutex<HashMap<usize, u32>>,
    chunk_delays: StdMutex<HashMap<usize, Duration>>,
    chunk_calls: StdMutex<Vec<usize>>,
    initiate_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl FakeApi {
    fn new(chunk_size: u64) -> Arc<Self> {
        Arc::new(Self {
            chunk_size,
            chunk_failures: StdMutex::new(HashMap::new()),
            chunk_delays: StdMutex::new(HashMap::new()),
            chunk_calls: StdMutex::new(Vec::new()),
            initiate_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        })
    }

    fn fail_chunk(&self, index: usize, times: u32) {
        self.chunk_failures.lock().unwrap().insert(index, times);
    }

    fn delay_chunk(&self, index: usize, delay: Duration) {
        self.chunk_delays.lock().unwrap().insert(index, delay);
    }

    fn chunk_calls(&self) -> Vec<usize> {
        self.chunk_calls.lock().unwrap().clone()
    }

    fn calls_for(&self, index: usize) -> usize {
        self.chunk_calls().iter().filter(|i| **i == index).count()
    }
}

#[async_trait]
impl crate::client::UploadApi for FakeApi {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse, ApiError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(InitiateResponse {
            upload_id: format!("u-{}", request.file_hash),
            chunk_size: self.chunk_size,
            total_chunks: chunk_count(request.file_size, self.chunk_size),
            file_id: None,
            message: None,
        })
    }

    async fn upload_chunk(
        &self,
        request: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkResponse, ApiError> {
        self.chunk_calls.lock().unwrap().push(request.chunk_index);
        let delay = self
            .chunk_delays
            .lock()
            .unwrap()
            .get(&request.chunk_index)
            .copied();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            }
        } else if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        let failed = {
            let mut failures = self.chunk_failures.lock().unwrap();
            match failures.get_mut(&request.chunk_index) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if failed {
            return Err(ApiError::Server {
                status: 500,
                message: "injected failure".to_string(),
            });
        }
        Ok(ChunkResponse {
            success: true,
            upload_id: request.upload_id.clone(),
            chunk_index: request.chunk_index,
        })
    }

    async fn finalize(&self, request: &FinalizeRequest) -> Result<FinalizeResponse, ApiError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(FinalizeResponse {
            success: true,
            upload_id: request.upload_id.clone(),
            file_id: "file-xyz".to_string(),
        })
    }

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ApiError> {
        Ok(StatusResponse {
            upload_id: upload_id.to_string(),
            status: RemoteUploadStatus::InProgress,
            uploaded_chunks: 0,
            total_chunks: 0,
            file_id: None,
            error: None,
        })
    }
}

#[derive(Default)]
struct RecordingHistory {
    entries: StdMutex<Vec<HistoryEntry>>,
}

impl RecordingHistory {
    fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryEmitter for RecordingHistory {
    async fn emit(&self, entry: HistoryEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

fn test_config() -> UploadConfig {
    UploadConfig {
        chunk_size: 1024,
        progress_debounce: Duration::from_millis(10),
        persistence_debounce: Duration::from_millis(10),
        initial_retry_delay: Duration::from_millis(20),
        ..UploadConfig::default()
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    api: Arc<FakeApi>,
    history: Arc<RecordingHistory>,
    events: EventBroadcaster,
    store: Arc<SessionStore>,
    dir: tempfile::TempDir,
}

fn build(api: Arc<FakeApi>, blobs: Arc<MemoryBlobs>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    build_in(api, blobs, dir)
}

fn build_in(api: Arc<FakeApi>, blobs: Arc<MemoryBlobs>, dir: tempfile::TempDir) -> Harness {
    let config = test_config();
    let store = Arc::new(SessionStore::new(dir.path(), &config));
    let events = EventBroadcaster::new(256);
    let history = Arc::new(RecordingHistory::default());
    let history_sink: Arc<dyn HistoryEmitter> = history.clone();
    let coordinator = Coordinator::new(
        api.clone(),
        blobs,
        store.clone(),
        events.clone(),
        history_sink,
        config,
    );
    Harness {
        coordinator,
        api,
        history,
        events,
        store,
        dir,
    }
}

fn descriptor(id: &str, size: u64, source_ref: &str) -> FileDescriptor {
    FileDescriptor {
        id: id.to_string(),
        name: format!("{id}.mp4"),
        size,
        mime_type: "video/mp4".to_string(),
        source_ref: Some(source_ref.to_string()),
    }
}

async fn wait_for_status(coordinator: &Arc<Coordinator>, id: &str, status: UploadStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let matched = coordinator
                .aggregate_state()
                .await
                .items
                .iter()
                .any(|item| item.file.id == id && item.status == status);
            if matched {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("item {id} never reached {status:?}"));
}

fn drain_statuses(receiver: &mut broadcast::Receiver<Event>, id: &str) -> Vec<UploadStatus> {
    let mut statuses = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(Event::ItemStatusChanged { id: event_id, status, .. }) if event_id == id => {
                statuses.push(status);
            }
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    statuses
}

#[tokio::test]
async fn enqueue_rejects_invalid_batches_before_anything_starts() {
    let api = FakeApi::new(1024);
    let h = build(api, MemoryBlobs::single("clip.bin", 2048));

    let mut bad = descriptor("f1", 2048, "clip.bin");
    bad.mime_type = "application/pdf".to_string();
    let err = h.coordinator.enqueue(vec![bad], None).await.unwrap_err();
    assert!(matches!(err, ValidationError::WrongType { .. }));
    assert!(h.coordinator.aggregate_state().await.items.is_empty());
    assert_eq!(h.api.initiate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn enqueued_item_auto_starts_and_runs_to_completion() {
    let api = FakeApi::new(1024);
    let h = build(api, MemoryBlobs::single("clip.bin", 2560));
    let mut receiver = h.events.subscribe();

    h.coordinator
        .enqueue(vec![descriptor("f1", 2560, "clip.bin")], None)
        .await
        .unwrap();
    wait_for_status(&h.coordinator, "f1", UploadStatus::Completed).await;

    // Let any stray events land, then read the observable sequence.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let statuses = drain_statuses(&mut receiver, "f1");
    assert_eq!(
        statuses,
        vec![
            UploadStatus::Queued,
            UploadStatus::Uploading,
            UploadStatus::Completed
        ]
    );

    let state = h.coordinator.aggregate_state().await;
    let item = state.items.iter().find(|i| i.file.id == "f1").unwrap();
    assert_eq!(item.progress.uploaded_bytes, 2560);
    assert_eq!(item.progress.percent, 100);
    assert_eq!(state.overall_percent, 100);

    let mut indices = h.api.chunk_calls();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(h.api.finalize_calls.load(Ordering::SeqCst), 1);

    // Exactly one history entry for the finished upload.
    let entries = h.history.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "f1");
    assert_eq!(entries[0].size, 2560);

    // Terminal means terminal: nothing further lands for this id.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain_statuses(&mut receiver, "f1").is_empty());
}

#[tokio::test]
async fn pause_emits_one_event_and_resume_skips_uploaded_chunks() {
    let api = FakeApi::new(1024);
    api.delay_chunk(1, Duration::from_millis(500));
    let h = build(api, MemoryBlobs::single("clip.bin", 2048));

    h.coordinator
        .enqueue(vec![descriptor("f1", 2048, "clip.bin")], None)
        .await
        .unwrap();

    // Wait for chunk 0 to land while chunk 1 is held in flight.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let progressed = h
                .coordinator
                .aggregate_state()
                .await
                .items
                .first()
                .is_some_and(|item| item.progress.uploaded_bytes >= 1024);
            if progressed && h.api.calls_for(1) >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first chunk never landed");

    let mut receiver = h.events.subscribe();
    assert!(h.coordinator.pause("f1").await);
    wait_for_status(&h.coordinator, "f1", UploadStatus::Paused).await;

    // The optimistic local flip and the engine callback collapse into one
    // observable paused event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let paused = drain_statuses(&mut receiver, "f1")
        .into_iter()
        .filter(|status| *status == UploadStatus::Paused)
        .count();
    assert_eq!(paused, 1);

    assert!(h.coordinator.resume("f1").await);
    wait_for_status(&h.coordinator, "f1", UploadStatus::Completed).await;

    assert_eq!(h.api.calls_for(0), 1);
    assert!(h.api.calls_for(1) >= 2);
}

#[tokio::test]
async fn cancel_removes_the_item_and_never_finalizes() {
    let api = FakeApi::new(1024);
    api.delay_chunk(0, Duration::from_secs(30));
    let h = build(api, MemoryBlobs::single("clip.bin", 1024));
    let mut receiver = h.events.subscribe();

    h.coordinator
        .enqueue(vec![descriptor("f1", 1024, "clip.bin")], None)
        .await
        .unwrap();
    let api_probe = h.api.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if api_probe.calls_for(0) >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("chunk never started");

    assert!(h.coordinator.cancel("f1").await);
    assert!(h.coordinator.aggregate_state().await.items.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.api.finalize_calls.load(Ordering::SeqCst), 0);
    assert!(
        !drain_statuses(&mut receiver, "f1").contains(&UploadStatus::Completed)
    );

    h.store.flush().await;
    assert!(h.store.load_sessions().await.is_empty());
}

#[tokio::test]
async fn retry_restarts_an_errored_item_and_counts_it() {
    let api = FakeApi::new(1024);
    // Initial attempt plus three retries all fail; the fifth call succeeds.
    api.fail_chunk(0, 4);
    let h = build(api, MemoryBlobs::single("clip.bin", 1024));

    h.coordinator
        .enqueue(vec![descriptor("f1", 1024, "clip.bin")], None)
        .await
        .unwrap();
    wait_for_status(&h.coordinator, "f1", UploadStatus::Error).await;

    let state = h.coordinator.aggregate_state().await;
    let item = state.items.iter().find(|i| i.file.id == "f1").unwrap();
    assert_eq!(item.retries, 0);
    assert!(item.error_message.as_deref().unwrap().contains("injected failure"));

    assert!(h.coordinator.retry("f1").await);
    wait_for_status(&h.coordinator, "f1", UploadStatus::Completed).await;

    let state = h.coordinator.aggregate_state().await;
    let item = state.items.iter().find(|i| i.file.id == "f1").unwrap();
    assert_eq!(item.retries, 1);
    assert!(item.error_message.is_none());
    assert_eq!(h.api.finalize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_completed_drops_items_and_their_refs() {
    let api = FakeApi::new(1024);
    let h = build(api, MemoryBlobs::single("clip.bin", 1024));

    h.coordinator
        .enqueue(vec![descriptor("f1", 1024, "clip.bin")], None)
        .await
        .unwrap();
    wait_for_status(&h.coordinator, "f1", UploadStatus::Completed).await;

    assert_eq!(h.coordinator.clear_completed().await, 1);
    assert!(h.coordinator.aggregate_state().await.items.is_empty());

    h.store.flush().await;
    assert!(h.store.load_source_refs().await.is_empty());
}

#[tokio::test]
async fn background_transition_persists_state_without_waiting_for_debounce() {
    let api = FakeApi::new(1024);
    api.delay_chunk(0, Duration::from_secs(30));
    let h = build(api, MemoryBlobs::single("clip.bin", 1024));

    h.coordinator
        .enqueue(vec![descriptor("f1", 1024, "clip.bin")], None)
        .await
        .unwrap();
    wait_for_status(&h.coordinator, "f1", UploadStatus::Uploading).await;

    h.coordinator.on_background().await;

    // A second store over the same directory sees the flushed documents.
    let probe = SessionStore::new(h.dir.path(), &test_config());
    let aggregate = probe.load_aggregate().await.expect("aggregate not written");
    assert_eq!(aggregate.items.len(), 1);
    assert_eq!(aggregate.items[0].file.id, "f1");
    assert_eq!(probe.load_source_refs().await["f1"], "clip.bin");
}

#[tokio::test]
async fn restart_recovers_sessions_and_uploads_only_the_remainder() {
    let blobs = MemoryBlobs::single("clip.bin", 3072);

    // First run: two of three chunks land, then the app "dies".
    let api_one = FakeApi::new(1024);
    api_one.delay_chunk(2, Duration::from_secs(60));
    let h1 = build(api_one, blobs.clone());
    h1.coordinator
        .enqueue(vec![descriptor("f1", 3072, "clip.bin")], None)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = h1
                .coordinator
                .aggregate_state()
                .await
                .items
                .first()
                .is_some_and(|item| item.progress.uploaded_bytes >= 2048);
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first two chunks never landed");
    h1.coordinator.on_background().await;

    // Second run over the same state directory.
    let api_two = FakeApi::new(1024);
    let dir = h1.dir;
    let h2 = build_in(api_two, blobs, dir);
    h2.coordinator.init().await;
    h2.coordinator.on_foreground().await;
    wait_for_status(&h2.coordinator, "f1", UploadStatus::Completed).await;

    let mut indices = h2.api.chunk_calls();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices, vec![2]);
    assert_eq!(h2.api.initiate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h2.api.finalize_calls.load(Ordering::SeqCst), 1);
}
