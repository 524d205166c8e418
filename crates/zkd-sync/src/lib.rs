//! zkd-sync: encrypted object transfer engine
//!
//! - `upload`: the upload session state machine (plan, transfer, confirm, finalize)
//! - `download`: per-object session registry and decrypting byte-range reads
//! - `queue`: durable offline write queue with ordered, backed-off replay
//! - `retry`: the one retry policy shared by chunk transfer, confirm and replay
//! - `progress`: monotonic progress accumulation for concurrent chunk tasks
//! - `conflict`: naming-conflict resolution and `name (n).ext` disambiguation

pub mod conflict;
pub mod download;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod upload;

pub use conflict::{next_available_name, ConflictResolver, FixedResolver};
pub use download::{build_chunk_map, ChunkMapEntry, DownloadSessionManager, ObjectSummary, SIZE_SNAP_TOLERANCE};
pub use progress::{ProgressEvent, ProgressFn, ProgressTracker};
pub use queue::{
    ApiQueueExecutor, JsonFileQueueStore, MemoryQueueStore, OfflineSyncQueue, QueueExecutor, QueueOp,
    QueueStore, ReplayReport, SyncQueueItem,
};
pub use retry::RetryPolicy;
pub use upload::{
    ChunkSource, FileSource, MemorySource, ResumeToken, UploadControl, UploadOptions, UploadOutcome,
    UploadReceipt, UploadSessionCoordinator, UploadState,
};
