//! Durable offline write queue
//!
//! Write operations that failed for lack of connectivity are parked here
//! and replayed later in creation order. A failure during replay bumps the
//! item's retry count, schedules it `min(cap, base * 2^retries)` into the
//! future and stops the pass; nothing behind it runs until it succeeds, so
//! a manifest save never overtakes the chunk upload it depends on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zkd_core::types::{b64, unix_now_millis};
use zkd_core::{ZkdError, ZkdResult};
use zkd_storage::{BlobTransport, MetadataCommit, ObjectApi, TransferScheduler};

use crate::retry::RetryPolicy;

/// A parked write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueOp {
    /// Re-upload one sealed chunk of an open upload session. A fresh
    /// target is requested at replay time; the original URL may be stale.
    UploadChunk {
        session_id: String,
        index: u64,
        #[serde(with = "b64")]
        ciphertext: Vec<u8>,
        content_digest: String,
    },
    /// Commit encrypted metadata for an existing object.
    SaveManifest { object_id: String, commit: MetadataCommit },
}

impl QueueOp {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueOp::UploadChunk { .. } => "upload_chunk",
            QueueOp::SaveManifest { .. } => "save_manifest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    /// Object the write belongs to
    pub parent_id: String,
    pub op: QueueOp,
    pub retry_count: u32,
    /// Unix milliseconds
    pub created_at: u64,
    /// Tie-breaker for items created within the same millisecond
    pub seq: u64,
    /// Unix milliseconds before which replay leaves this item alone
    #[serde(default)]
    pub next_attempt_at: u64,
}

fn replay_order(items: &mut [SyncQueueItem]) {
    items.sort_by_key(|i| (i.created_at, i.seq));
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Durable backing store for the queue.
pub trait QueueStore: Send + Sync {
    fn load(&self) -> ZkdResult<Vec<SyncQueueItem>>;
    fn save(&self, items: &[SyncQueueItem]) -> ZkdResult<()>;
}

/// JSON file store, rewritten atomically (temp file then rename) on every save.
#[derive(Debug, Clone)]
pub struct JsonFileQueueStore {
    path: PathBuf,
}

impl JsonFileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueStore for JsonFileQueueStore {
    fn load(&self) -> ZkdResult<Vec<SyncQueueItem>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| ZkdError::Serialization(format!("parsing queue {}: {e}", self.path.display())))
    }

    fn save(&self, items: &[SyncQueueItem]) -> ZkdResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Volatile store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    items: std::sync::Mutex<Vec<SyncQueueItem>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with items exactly as given, order included.
    pub fn with_items(items: Vec<SyncQueueItem>) -> Self {
        Self {
            items: std::sync::Mutex::new(items),
        }
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> ZkdResult<Vec<SyncQueueItem>> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, items: &[SyncQueueItem]) -> ZkdResult<()> {
        *self.items.lock().unwrap_or_else(|e| e.into_inner()) = items.to_vec();
        Ok(())
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

/// Performs the network side of a queued write.
#[async_trait]
pub trait QueueExecutor: Send + Sync {
    async fn execute(&self, item: &SyncQueueItem) -> ZkdResult<()>;
}

/// Replays items against the object API and blob transport.
pub struct ApiQueueExecutor {
    api: Arc<dyn ObjectApi>,
    transport: Arc<dyn BlobTransport>,
    scheduler: TransferScheduler,
}

impl ApiQueueExecutor {
    pub fn new(api: Arc<dyn ObjectApi>, transport: Arc<dyn BlobTransport>, scheduler: TransferScheduler) -> Self {
        Self {
            api,
            transport,
            scheduler,
        }
    }
}

#[async_trait]
impl QueueExecutor for ApiQueueExecutor {
    async fn execute(&self, item: &SyncQueueItem) -> ZkdResult<()> {
        match &item.op {
            QueueOp::UploadChunk {
                session_id,
                index,
                ciphertext,
                content_digest,
            } => {
                let mut targets = self.api.fetch_upload_targets(session_id, &[*index]).await?;
                let target = targets
                    .remove(index)
                    .ok_or_else(|| ZkdError::Storage(format!("no upload target issued for chunk {index}")))?;
                let body = Bytes::from(ciphertext.clone());
                self.scheduler
                    .enqueue(self.transport.put(&target, body, content_digest))
                    .await?
            }
            QueueOp::SaveManifest { object_id, commit } => self.api.commit_metadata(object_id, commit).await,
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Items executed and removed
    pub completed: usize,
    /// Item that failed and halted the pass
    pub failed: Option<Uuid>,
    /// Earliest time (Unix ms) the next pass can make progress, when backing off
    pub deferred_until: Option<u64>,
    pub remaining: usize,
}

pub struct OfflineSyncQueue {
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn QueueExecutor>,
    backoff: RetryPolicy,
    items: Mutex<Vec<SyncQueueItem>>,
    replaying: Mutex<()>,
    online: Notify,
    seq: AtomicU64,
}

impl std::fmt::Debug for OfflineSyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSyncQueue")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl OfflineSyncQueue {
    /// Load persisted items from `store`.
    pub fn open(
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn QueueExecutor>,
        backoff: RetryPolicy,
    ) -> ZkdResult<Self> {
        let mut items = store.load()?;
        replay_order(&mut items);
        let next_seq = items.iter().map(|i| i.seq + 1).max().unwrap_or(0);
        if !items.is_empty() {
            info!(items = items.len(), "offline queue loaded");
        }
        Ok(Self {
            store,
            executor,
            backoff,
            items: Mutex::new(items),
            replaying: Mutex::new(()),
            online: Notify::new(),
            seq: AtomicU64::new(next_seq),
        })
    }

    /// Park a write. Persisted before returning.
    pub async fn enqueue(&self, parent_id: impl Into<String>, op: QueueOp) -> ZkdResult<Uuid> {
        let item = SyncQueueItem {
            id: Uuid::new_v4(),
            parent_id: parent_id.into(),
            retry_count: 0,
            created_at: unix_now_millis(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            next_attempt_at: 0,
            op,
        };
        let id = item.id;
        let mut items = self.items.lock().await;
        debug!(%id, parent = %item.parent_id, kind = item.op.kind(), "queueing write");
        items.push(item);
        if let Err(e) = self.store.save(&items) {
            items.pop();
            return Err(e);
        }
        Ok(id)
    }

    pub async fn size(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Snapshot in replay order.
    pub async fn items(&self) -> Vec<SyncQueueItem> {
        self.items.lock().await.clone()
    }

    /// Replay due items in creation order, stopping at the first failure.
    ///
    /// While the head item is backing off, nothing runs. Concurrent calls
    /// are serialized.
    pub async fn replay(&self) -> ZkdResult<ReplayReport> {
        self.replay_at(false).await
    }

    /// One pass that ignores pending backoff (an explicit user retry).
    pub async fn replay_now(&self) -> ZkdResult<ReplayReport> {
        self.replay_at(true).await
    }

    /// Connectivity came back: wake the run loop for an immediate pass
    /// that ignores pending backoff.
    pub fn notify_online(&self) {
        self.online.notify_one();
    }

    /// Replay on every tick and on every `notify_online`, until cancelled.
    pub async fn run(&self, cancel: CancellationToken, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let force = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => false,
                _ = self.online.notified() => true,
            };
            match self.replay_at(force).await {
                Ok(report) if report.completed > 0 || report.failed.is_some() => {
                    info!(
                        completed = report.completed,
                        remaining = report.remaining,
                        failed = ?report.failed,
                        "offline queue replay"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("offline queue replay failed: {e}"),
            }
        }
        debug!("offline queue loop stopped");
    }

    async fn replay_at(&self, ignore_backoff: bool) -> ZkdResult<ReplayReport> {
        let _pass = self.replaying.lock().await;
        let mut report = ReplayReport::default();

        let mut snapshot = self.items.lock().await.clone();
        replay_order(&mut snapshot);

        for mut item in snapshot {
            let now = unix_now_millis();
            if !ignore_backoff && item.next_attempt_at > now {
                debug!(id = %item.id, wait_ms = item.next_attempt_at - now, "queue head backing off");
                report.deferred_until = Some(item.next_attempt_at);
                break;
            }

            match self.executor.execute(&item).await {
                Ok(()) => {
                    let mut items = self.items.lock().await;
                    items.retain(|i| i.id != item.id);
                    self.store.save(&items)?;
                    report.completed += 1;
                    debug!(id = %item.id, parent = %item.parent_id, kind = item.op.kind(), "queued write replayed");
                }
                Err(e) => {
                    item.retry_count = item.retry_count.saturating_add(1);
                    let delay = self.backoff.delay_for(item.retry_count - 1);
                    item.next_attempt_at = unix_now_millis() + delay.as_millis() as u64;
                    warn!(
                        id = %item.id,
                        parent = %item.parent_id,
                        kind = item.op.kind(),
                        retries = item.retry_count,
                        ?delay,
                        "queued write failed: {e}"
                    );

                    let mut items = self.items.lock().await;
                    if let Some(slot) = items.iter_mut().find(|i| i.id == item.id) {
                        slot.retry_count = item.retry_count;
                        slot.next_attempt_at = item.next_attempt_at;
                    }
                    self.store.save(&items)?;
                    report.failed = Some(item.id);
                    report.deferred_until = Some(item.next_attempt_at);
                    break;
                }
            }
        }

        report.remaining = self.items.lock().await.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records execution order; fails any item whose parent is in `failing`.
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(String, &'static str)>>,
        failing: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl QueueExecutor for Recorder {
        async fn execute(&self, item: &SyncQueueItem) -> ZkdResult<()> {
            self.seen
                .lock()
                .unwrap()
                .push((item.parent_id.clone(), item.op.kind()));
            if self.failing.lock().unwrap().contains(&item.parent_id) {
                return Err(ZkdError::NetworkTransient("offline".into()));
            }
            Ok(())
        }
    }

    fn save_op(object_id: &str) -> QueueOp {
        QueueOp::SaveManifest {
            object_id: object_id.into(),
            commit: MetadataCommit {
                encrypted_metadata: vec![1, 2, 3],
                manifest_hash: None,
            },
        }
    }

    fn chunk_op(index: u64) -> QueueOp {
        QueueOp::UploadChunk {
            session_id: "s1".into(),
            index,
            ciphertext: vec![9; 8],
            content_digest: "d".into(),
        }
    }

    fn backoff() -> RetryPolicy {
        RetryPolicy::new(u32::MAX, Duration::from_secs(60), Duration::from_secs(600))
    }

    fn queue(store: Arc<dyn QueueStore>, exec: Arc<Recorder>) -> OfflineSyncQueue {
        OfflineSyncQueue::open(store, exec, backoff()).unwrap()
    }

    #[tokio::test]
    async fn replays_in_creation_order_and_drains() {
        let exec = Arc::new(Recorder::default());
        let q = queue(Arc::new(MemoryQueueStore::new()), exec.clone());
        q.enqueue("A", chunk_op(0)).await.unwrap();
        q.enqueue("A", save_op("A")).await.unwrap();
        q.enqueue("B", save_op("B")).await.unwrap();
        assert_eq!(q.size().await, 3);

        let report = q.replay().await.unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(
            *exec.seen.lock().unwrap(),
            vec![
                ("A".to_string(), "upload_chunk"),
                ("A".to_string(), "save_manifest"),
                ("B".to_string(), "save_manifest"),
            ]
        );
    }

    #[tokio::test]
    async fn failure_halts_and_backs_off() {
        let exec = Arc::new(Recorder::default());
        exec.failing.lock().unwrap().push("A".into());
        let q = queue(Arc::new(MemoryQueueStore::new()), exec.clone());
        q.enqueue("A", chunk_op(0)).await.unwrap();
        q.enqueue("B", save_op("B")).await.unwrap();

        let before = unix_now_millis();
        let report = q.replay().await.unwrap();
        assert_eq!(report.completed, 0);
        assert_eq!(report.remaining, 2);
        assert!(report.failed.is_some());
        assert!(report.deferred_until.unwrap() >= before + 60_000);

        let items = q.items().await;
        assert_eq!(items[0].retry_count, 1);

        // still inside the backoff window: no attempt at all
        let report = q.replay().await.unwrap();
        assert_eq!(report.completed, 0);
        assert!(report.failed.is_none());
        assert_eq!(exec.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn forced_pass_ignores_backoff() {
        let exec = Arc::new(Recorder::default());
        exec.failing.lock().unwrap().push("A".into());
        let q = queue(Arc::new(MemoryQueueStore::new()), exec.clone());
        q.enqueue("A", save_op("A")).await.unwrap();
        q.replay().await.unwrap();

        exec.failing.lock().unwrap().clear();
        let report = q.replay_now().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(q.size().await, 0);
    }

    #[tokio::test]
    async fn persisted_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let exec = Arc::new(Recorder::default());
        {
            let q = queue(Arc::new(JsonFileQueueStore::new(&path)), exec.clone());
            q.enqueue("A", chunk_op(3)).await.unwrap();
            q.enqueue("A", save_op("A")).await.unwrap();
        }
        let q = queue(Arc::new(JsonFileQueueStore::new(&path)), exec.clone());
        let items = q.items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].op, chunk_op(3));

        // new items sort after the reloaded ones
        q.enqueue("A", save_op("A2")).await.unwrap();
        let items = q.items().await;
        assert!(items[2].seq > items[1].seq);
    }

    #[test]
    fn item_wire_shape() {
        let item = SyncQueueItem {
            id: Uuid::nil(),
            parent_id: "A".into(),
            op: chunk_op(1),
            retry_count: 0,
            created_at: 5,
            seq: 0,
            next_attempt_at: 0,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["op"]["kind"], "upload_chunk");
        assert_eq!(json["op"]["ciphertext"], "CQkJCQkJCQk=");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileQueueStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }
}
