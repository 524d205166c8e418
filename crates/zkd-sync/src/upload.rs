//! Upload session coordinator
//!
//! Drives one object through the upload state machine:
//!
//! ```text
//! Planning → Initialized → Transferring → Confirming → Finalizing → Complete
//!                 │              │
//!              Conflict     Paused / Cancelled / Deferred
//! ```
//!
//! Each chunk is read, processed on the CPU pool and PUT through the
//! transfer scheduler by its own task; at most `concurrency` chunk tasks
//! (and therefore chunk buffers) exist at once. Pause and cancel are
//! cooperative: no new chunk task starts once either is requested, while
//! transfers already on the wire finish on their own.
//!
//! With an offline queue attached, a chunk whose PUT still fails with a
//! network error after every retry is sealed into the queue instead of
//! failing the upload. The upload then ends `Deferred` with a resume token;
//! resuming after the queue drains confirms the replayed chunks first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zkd_chunks::{assess_compression, plan_chunks, ChunkProcessor, ChunkSpan, CompressionDecision, ProcessorPool};
use zkd_core::config::{ChunkingConfig, TransferConfig};
use zkd_core::types::{unix_now, ChunkInfo, ConflictInfo, ConflictResolution, UploadTarget};
use zkd_core::{ZkdError, ZkdResult};
use zkd_crypto::{encrypt_name, Cek, KeyManager, KeyWrapEnvelope, ManifestFields, ManifestSigner};
use zkd_storage::{BlobTransport, FinalizeRequest, InitializeRequest, ObjectApi, PlannedChunk, TransferScheduler};

use crate::conflict::{next_available_name, ConflictResolver};
use crate::progress::{ProgressFn, ProgressTracker};
use crate::queue::{OfflineSyncQueue, QueueOp};
use crate::retry::RetryPolicy;

/// Upload targets requested per on-demand fetch
const TARGET_BATCH: usize = 64;

/// Conflict resolutions attempted before giving up on a name
const MAX_CONFLICT_ROUNDS: u32 = 32;

// ── Sources ───────────────────────────────────────────────────────────────────

/// Random-access plaintext for an upload.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes at `offset`.
    async fn read_at(&self, offset: u64, len: u64) -> ZkdResult<Vec<u8>>;
}

fn short_read(offset: u64, len: u64) -> ZkdError {
    ZkdError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("source ended before {len} bytes at offset {offset}"),
    ))
}

/// A file on disk, opened per chunk read.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> ZkdResult<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            len: meta.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_at(&self, offset: u64, len: u64) -> ZkdResult<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => short_read(offset, len),
            _ => ZkdError::Io(e),
        })?;
        Ok(buf)
    }
}

/// In-memory plaintext.
#[derive(Debug, Clone)]
pub struct MemorySource(Bytes);

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read_at(&self, offset: u64, len: u64) -> ZkdResult<Vec<u8>> {
        let end = offset.checked_add(len).ok_or_else(|| short_read(offset, len))?;
        if end > self.len() {
            return Err(short_read(offset, len));
        }
        Ok(self.0[offset as usize..end as usize].to_vec())
    }
}

// ── Control ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Planning,
    Initialized,
    Transferring,
    Confirming,
    Finalizing,
    Complete,
    Paused,
    /// Some chunks were handed to the offline queue
    Deferred,
    Cancelled,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Paused,
    Cancelled,
}

/// Caller handle for one upload: pause, cancel, and state observation.
///
/// A control is single-use; resume a paused upload with a fresh one.
#[derive(Clone)]
pub struct UploadControl {
    halt: CancellationToken,
    reason: Arc<Mutex<Option<Interruption>>>,
    state: Arc<watch::Sender<UploadState>>,
}

impl Default for UploadControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UploadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadControl")
            .field("state", &self.state())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl UploadControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(UploadState::Planning);
        Self {
            halt: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            state: Arc::new(tx),
        }
    }

    /// Stop after in-flight chunks finish; the upload yields a resume token.
    pub fn pause(&self) {
        self.interrupt(Interruption::Paused, false);
    }

    /// Stop after in-flight chunks finish; the upload fails with `Cancelled`.
    /// Overrides an earlier pause.
    pub fn cancel(&self) {
        self.interrupt(Interruption::Cancelled, true);
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    fn interrupt(&self, why: Interruption, overriding: bool) {
        let mut reason = self.reason_lock();
        if reason.is_none() || overriding {
            *reason = Some(why);
        }
        drop(reason);
        self.halt.cancel();
    }

    fn reason_lock(&self) -> MutexGuard<'_, Option<Interruption>> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn interruption(&self) -> Option<Interruption> {
        *self.reason_lock()
    }

    fn check(&self) -> ZkdResult<()> {
        match self.interruption() {
            Some(Interruption::Paused) => Err(ZkdError::Paused),
            Some(Interruption::Cancelled) => Err(ZkdError::Cancelled),
            None => Ok(()),
        }
    }

    fn set_state(&self, state: UploadState) {
        let old = self.state.send_replace(state);
        if old != state {
            debug!(from = ?old, to = ?state, "upload state");
        }
    }
}

// ── Inputs and results ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Plaintext object name; encrypted before it leaves the client
    pub name: String,
    pub mime_type: String,
    /// Optional content hash bound into the signed manifest
    pub content_hash: Option<String>,
}

impl UploadOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: "application/octet-stream".into(),
            content_hash: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Everything needed to continue a paused upload in a later process.
///
/// Holds no key material in the clear: the CEK travels only inside the
/// self-wrapped envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub session_id: String,
    pub object_id: String,
    pub name: String,
    pub fields: ManifestFields,
    pub envelope: KeyWrapEnvelope,
    pub compression: CompressionDecision,
    pub plan: Vec<ChunkSpan>,
    pub confirmed: Vec<ChunkInfo>,
    /// Chunks sealed into the offline queue and not yet confirmed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queued: Vec<ChunkInfo>,
    /// Object this upload supersedes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced: Option<String>,
}

impl ResumeToken {
    pub fn load(path: &Path) -> ZkdResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Atomic write: temp file, then rename.
    pub fn save(&self, path: &Path) -> ZkdResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn confirmed_bytes(&self) -> u64 {
        self.confirmed.iter().map(|c| c.plaintext_size).sum()
    }
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub object_id: String,
    pub session_id: String,
    /// Name the object was stored under (differs from the request after keep-both)
    pub name: String,
    pub size: u64,
    pub manifest_hash: String,
    /// Confirmed chunks in index order
    pub chunks: Vec<ChunkInfo>,
    /// Transfer attempts per chunk uploaded by this run
    pub attempts: BTreeMap<u64, u32>,
    /// Object superseded by this upload
    pub replaced: Option<String>,
}

#[derive(Debug)]
pub enum UploadOutcome {
    Complete(UploadReceipt),
    Paused(ResumeToken),
    /// Network failures moved chunks to the offline queue; resume once it drains
    Deferred(ResumeToken),
    /// The caller chose to skip a conflicting name
    Skipped(ConflictInfo),
}

// ── Session ───────────────────────────────────────────────────────────────────

struct Session {
    session_id: String,
    object_id: String,
    name: String,
    fields: ManifestFields,
    envelope: KeyWrapEnvelope,
    compression: CompressionDecision,
    plan: Vec<ChunkSpan>,
    processor: Arc<ChunkProcessor>,
    replaced: Option<String>,
    targets: Mutex<BTreeMap<u64, UploadTarget>>,
    target_fetch: tokio::sync::Mutex<()>,
    confirmed: Mutex<BTreeMap<u64, ChunkInfo>>,
}

impl Session {
    fn targets(&self) -> MutexGuard<'_, BTreeMap<u64, UploadTarget>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn confirmed(&self) -> MutexGuard<'_, BTreeMap<u64, ChunkInfo>> {
        self.confirmed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn target(&self, index: u64) -> Option<UploadTarget> {
        self.targets().get(&index).cloned()
    }

    fn missing(&self) -> Vec<u64> {
        let confirmed = self.confirmed();
        self.plan
            .iter()
            .map(|s| s.index)
            .filter(|i| !confirmed.contains_key(i))
            .collect()
    }

    fn resume_token(&self, ledger: &RunLedger) -> ResumeToken {
        let confirmed = self.confirmed();
        ResumeToken {
            session_id: self.session_id.clone(),
            object_id: self.object_id.clone(),
            name: self.name.clone(),
            fields: self.fields.clone(),
            envelope: self.envelope.clone(),
            compression: self.compression,
            plan: self.plan.clone(),
            confirmed: confirmed.values().cloned().collect(),
            queued: ledger
                .queued
                .values()
                .filter(|c| !confirmed.contains_key(&c.index))
                .cloned()
                .collect(),
            replaced: self.replaced.clone(),
        }
    }
}

/// Chunks uploaded during this run, and the attempts each took
#[derive(Default)]
struct RunLedger {
    uploaded: BTreeMap<u64, ChunkInfo>,
    attempts: BTreeMap<u64, u32>,
    /// Chunks handed to the offline queue instead of uploaded
    queued: BTreeMap<u64, ChunkInfo>,
}

/// How one chunk task ended
enum ChunkTransfer {
    Uploaded(ChunkInfo, u32),
    Queued(ChunkInfo),
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct UploadSessionCoordinator {
    api: Arc<dyn ObjectApi>,
    transport: Arc<dyn BlobTransport>,
    keys: Arc<KeyManager>,
    pool: Arc<ProcessorPool>,
    scheduler: TransferScheduler,
    retry: RetryPolicy,
    chunking: ChunkingConfig,
    concurrency: usize,
    confirm_rounds: u32,
    resolver: Option<Arc<dyn ConflictResolver>>,
    offline: Option<Arc<OfflineSyncQueue>>,
}

impl std::fmt::Debug for UploadSessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessionCoordinator")
            .field("concurrency", &self.concurrency)
            .field("confirm_rounds", &self.confirm_rounds)
            .field("retry", &self.retry)
            .field("offline_queue", &self.offline.is_some())
            .finish_non_exhaustive()
    }
}

impl UploadSessionCoordinator {
    pub fn new(
        api: Arc<dyn ObjectApi>,
        transport: Arc<dyn BlobTransport>,
        keys: Arc<KeyManager>,
        pool: Arc<ProcessorPool>,
        scheduler: TransferScheduler,
    ) -> Self {
        let transfer = TransferConfig::default();
        Self {
            api,
            transport,
            keys,
            pool,
            scheduler,
            retry: RetryPolicy::from_config(&transfer),
            chunking: ChunkingConfig::default(),
            concurrency: transfer.effective_concurrency(),
            confirm_rounds: transfer.confirm_rounds.max(1),
            resolver: None,
            offline: None,
        }
    }

    /// Apply `[transfer]`: retry policy, concurrency and confirm rounds.
    pub fn with_transfer_config(mut self, cfg: &TransferConfig) -> Self {
        self.retry = RetryPolicy::from_config(cfg);
        self.concurrency = cfg.effective_concurrency();
        self.confirm_rounds = cfg.confirm_rounds.max(1);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Queue chunks that exhaust their network retries instead of failing.
    pub fn with_offline_queue(mut self, queue: Arc<OfflineSyncQueue>) -> Self {
        self.offline = Some(queue);
        self
    }

    /// Upload `source` as a new object.
    pub async fn upload(
        &self,
        source: Arc<dyn ChunkSource>,
        options: UploadOptions,
        control: &UploadControl,
        progress: Option<ProgressFn>,
    ) -> ZkdResult<UploadOutcome> {
        control.set_state(UploadState::Planning);
        control.check()?;

        let size = source.len();
        let plan = plan_chunks(size, &self.chunking);
        let sample = source
            .read_at(0, size.min(self.chunking.compression_sample_bytes))
            .await?;
        let compression = assess_compression(&options.name, &sample, &self.chunking);
        drop(sample);

        let keypairs = self.keys.get_or_decrypt_user_keypairs()?;
        let cek = Arc::new(self.keys.generate_cek());
        let envelope = self.keys.wrap_cek_for_self(&cek)?;
        let created_at = unix_now();
        let chunk_plan: Vec<PlannedChunk> = plan
            .iter()
            .map(|s| PlannedChunk {
                index: s.index,
                plaintext_size: s.len,
            })
            .collect();

        debug!(name = %options.name, size, chunks = plan.len(), ?compression, "upload planned");

        let mut name = options.name.clone();
        let mut replace: Option<String> = None;
        let mut conflicts = 0u32;
        let (init, fields) = loop {
            control.check()?;
            let fields = manifest_fields(&cek, &name, size, &options, created_at)?;
            let signed = ManifestSigner::build_and_sign(&fields, &keypairs)?;
            let request = InitializeRequest {
                encrypted_name: fields.name.clone(),
                size,
                mime_type: options.mime_type.clone(),
                chunk_plan: chunk_plan.clone(),
                envelope: envelope.clone(),
                manifest_hash: signed.manifest_hash,
                signatures: signed.signatures,
                manifest_created_at: created_at,
                content_hash: fields.content_hash.clone(),
                replace_object_id: replace.clone(),
            };

            match self.retry.run(|_| self.api.initialize_session(&request)).await {
                Ok((init, _)) => break (init, fields),
                Err(ZkdError::Conflict(reported)) => {
                    control.set_state(UploadState::Conflict);
                    let conflict = ConflictInfo {
                        conflicting_name: name.clone(),
                        existing_object_id: reported.existing_object_id,
                        proposed_name: Some(next_available_name(&name)),
                    };
                    conflicts += 1;
                    if conflicts > MAX_CONFLICT_ROUNDS {
                        return Err(ZkdError::Conflict(conflict));
                    }
                    let decision = self.resolver.as_ref().and_then(|r| r.resolve(&conflict));
                    info!(
                        name = %conflict.conflicting_name,
                        existing = %conflict.existing_object_id,
                        ?decision,
                        "name conflict"
                    );
                    match decision {
                        Some(ConflictResolution::Replace) => {
                            if replace.as_deref() == Some(conflict.existing_object_id.as_str()) {
                                // replacing that object was already refused
                                return Err(ZkdError::Conflict(conflict));
                            }
                            replace = Some(conflict.existing_object_id);
                        }
                        Some(ConflictResolution::KeepBoth) => {
                            name = conflict.proposed_name.unwrap_or_else(|| next_available_name(&name));
                            replace = None;
                        }
                        Some(ConflictResolution::Skip) => return Ok(UploadOutcome::Skipped(conflict)),
                        None => return Err(ZkdError::Conflict(conflict)),
                    }
                }
                Err(e) => return Err(e),
            }
        };

        control.set_state(UploadState::Initialized);
        info!(
            object_id = %init.object_id,
            session_id = %init.session_id,
            size,
            chunks = plan.len(),
            "upload session initialized"
        );

        let tracker = ProgressTracker::new(init.object_id.clone(), size, progress);
        let processor = Arc::new(ChunkProcessor::new(init.object_id.clone(), cek, compression));
        let session = Session {
            session_id: init.session_id,
            object_id: init.object_id,
            name,
            fields,
            envelope,
            compression,
            plan,
            processor,
            replaced: replace,
            targets: Mutex::new(init.upload_targets),
            target_fetch: tokio::sync::Mutex::new(()),
            confirmed: Mutex::new(BTreeMap::new()),
        };
        self.drive(session, source, control, tracker, RunLedger::default())
            .await
    }

    /// Continue a paused or deferred upload. Chunks in `token.confirmed` are
    /// neither re-read nor re-uploaded, and count toward progress from the
    /// start. Chunks in `token.queued` are confirmed before anything is
    /// transferred; only those the backend has not received are re-sent.
    pub async fn resume(
        &self,
        source: Arc<dyn ChunkSource>,
        token: ResumeToken,
        control: &UploadControl,
        progress: Option<ProgressFn>,
    ) -> ZkdResult<UploadOutcome> {
        control.set_state(UploadState::Planning);
        control.check()?;

        if source.len() != token.fields.size {
            return Err(ZkdError::ManifestMismatch {
                expected: format!("{} bytes", token.fields.size),
                actual: format!("{} bytes", source.len()),
            });
        }
        let planned: BTreeSet<u64> = token.plan.iter().map(|s| s.index).collect();
        if let Some(stray) = token
            .confirmed
            .iter()
            .chain(&token.queued)
            .find(|c| !planned.contains(&c.index))
        {
            return Err(ZkdError::Serialization(format!(
                "resume token lists chunk {} outside the plan",
                stray.index
            )));
        }

        let cek = Arc::new(self.keys.unwrap_cek_for_self(&token.envelope)?);
        let tracker = ProgressTracker::new(token.object_id.clone(), token.fields.size, progress);
        tracker.seed(token.confirmed.iter().map(|c| (c.index, c.plaintext_size)));

        info!(
            object_id = %token.object_id,
            session_id = %token.session_id,
            confirmed = token.confirmed.len(),
            queued = token.queued.len(),
            remaining = token.plan.len().saturating_sub(token.confirmed.len()),
            "resuming upload"
        );

        let ledger = RunLedger {
            uploaded: token.queued.into_iter().map(|c| (c.index, c)).collect(),
            ..RunLedger::default()
        };

        let processor = Arc::new(ChunkProcessor::new(token.object_id.clone(), cek, token.compression));
        let session = Session {
            session_id: token.session_id,
            object_id: token.object_id,
            name: token.name,
            fields: token.fields,
            envelope: token.envelope,
            compression: token.compression,
            plan: token.plan,
            processor,
            replaced: token.replaced,
            targets: Mutex::new(BTreeMap::new()),
            target_fetch: tokio::sync::Mutex::new(()),
            confirmed: Mutex::new(token.confirmed.into_iter().map(|c| (c.index, c)).collect()),
        };
        control.set_state(UploadState::Initialized);
        self.drive(session, source, control, tracker, ledger).await
    }

    async fn drive(
        &self,
        session: Session,
        source: Arc<dyn ChunkSource>,
        control: &UploadControl,
        tracker: ProgressTracker,
        mut ledger: RunLedger,
    ) -> ZkdResult<UploadOutcome> {
        let stop = control.halt.child_token();

        if !ledger.uploaded.is_empty() {
            // chunks the offline queue may have delivered since the last run
            control.set_state(UploadState::Confirming);
            self.confirm(&session, &ledger).await?;
            let confirmed = session.confirmed();
            for info in ledger.uploaded.values().filter(|c| confirmed.contains_key(&c.index)) {
                tracker.chunk_done(info.index, info.plaintext_size, 0);
            }
        }

        control.set_state(UploadState::Transferring);
        let pending = spans_for(&session, &session.missing());
        if let Err(e) = self
            .transfer_all(&session, source.as_ref(), &pending, control, &stop, &tracker, &mut ledger)
            .await
        {
            return self.interrupted(&session, &ledger, control, e).await;
        }
        if !ledger.queued.is_empty() {
            return self.deferred(&session, &ledger, control).await;
        }

        control.set_state(UploadState::Confirming);
        let mut rounds = 0;
        loop {
            let missing = self.confirm(&session, &ledger).await?;
            rounds += 1;
            if missing.is_empty() {
                break;
            }
            if rounds >= self.confirm_rounds {
                warn!(object_id = %session.object_id, ?missing, rounds, "chunks still missing after confirm");
                return Err(ZkdError::IncompleteUpload { missing });
            }
            warn!(object_id = %session.object_id, ?missing, round = rounds, "re-uploading unconfirmed chunks");

            // targets for rejected chunks may have been consumed or expired
            {
                let mut targets = session.targets();
                for index in &missing {
                    targets.remove(index);
                }
            }
            let spans = spans_for(&session, &missing);
            if let Err(e) = self
                .transfer_all(&session, source.as_ref(), &spans, control, &stop, &tracker, &mut ledger)
                .await
            {
                return self.interrupted(&session, &ledger, control, e).await;
            }
            if !ledger.queued.is_empty() {
                return self.deferred(&session, &ledger, control).await;
            }
        }

        control.set_state(UploadState::Finalizing);
        let receipt = self.finalize(&session, ledger.attempts).await?;
        control.set_state(UploadState::Complete);
        info!(
            object_id = %receipt.object_id,
            size = receipt.size,
            chunks = receipt.chunks.len(),
            manifest_hash = %receipt.manifest_hash,
            "upload complete"
        );
        Ok(UploadOutcome::Complete(receipt))
    }

    /// Run chunk tasks for `spans` with bounded concurrency.
    ///
    /// After the first hard failure no further task starts; tasks already
    /// started run to completion, and the first error is returned.
    #[allow(clippy::too_many_arguments)]
    async fn transfer_all(
        &self,
        session: &Session,
        source: &dyn ChunkSource,
        spans: &[ChunkSpan],
        control: &UploadControl,
        stop: &CancellationToken,
        tracker: &ProgressTracker,
        ledger: &mut RunLedger,
    ) -> ZkdResult<()> {
        let mut tasks = stream::iter(spans.iter().copied())
            .map(|span| self.transfer_chunk(session, source, span, control, stop, tracker))
            .buffer_unordered(self.concurrency);

        let mut first_error: Option<ZkdError> = None;
        while let Some(result) = tasks.next().await {
            match result {
                Ok(ChunkTransfer::Uploaded(info, attempts)) => {
                    *ledger.attempts.entry(info.index).or_insert(0) += attempts;
                    ledger.queued.remove(&info.index);
                    ledger.uploaded.insert(info.index, info);
                }
                Ok(ChunkTransfer::Queued(info)) => {
                    ledger.uploaded.remove(&info.index);
                    ledger.queued.insert(info.index, info);
                }
                Err(e) if first_error.is_none() => {
                    if !e.is_interruption() {
                        warn!(object_id = %session.object_id, "chunk failed, stopping upload: {e}");
                        stop.cancel();
                    }
                    first_error = Some(e);
                }
                Err(_) => {}
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn transfer_chunk(
        &self,
        session: &Session,
        source: &dyn ChunkSource,
        span: ChunkSpan,
        control: &UploadControl,
        stop: &CancellationToken,
        tracker: &ProgressTracker,
    ) -> ZkdResult<ChunkTransfer> {
        control.check()?;
        if stop.is_cancelled() {
            return Err(ZkdError::Cancelled);
        }

        let plaintext = source.read_at(span.offset, span.len).await?;
        let chunk = self
            .pool
            .encrypt(session.processor.clone(), span.index, plaintext)
            .await?;
        let body = Bytes::from(chunk.ciphertext);
        let digest = chunk.content_digest;

        let put = self
            .retry
            .run_until_cancelled(stop, |_| {
                let body = body.clone();
                let digest = digest.as_str();
                async move {
                    let target = self.target_for(session, span.index).await?;
                    let put = self
                        .scheduler
                        .enqueue(self.transport.put(&target, body, digest))
                        .await?;
                    if let Err(ZkdError::UrlExpired) = &put {
                        // the next attempt fetches a fresh target
                        session.targets().remove(&span.index);
                    }
                    put
                }
            })
            .await;
        let attempts = match put {
            Ok((_, attempts)) => attempts,
            Err(e) if e.is_retryable() => match &self.offline {
                Some(queue) => {
                    let op = QueueOp::UploadChunk {
                        session_id: session.session_id.clone(),
                        index: span.index,
                        ciphertext: body.to_vec(),
                        content_digest: digest,
                    };
                    queue.enqueue(session.object_id.clone(), op).await?;
                    warn!(
                        object_id = %session.object_id,
                        index = span.index,
                        "chunk upload failed, queued for replay: {e}"
                    );
                    return Ok(ChunkTransfer::Queued(chunk.info));
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };

        tracker.chunk_done(span.index, span.len, attempts);
        debug!(
            object_id = %session.object_id,
            index = span.index,
            attempts,
            encrypted_size = chunk.info.encrypted_size,
            "chunk uploaded"
        );
        Ok(ChunkTransfer::Uploaded(chunk.info, attempts))
    }

    /// Target for `index`, fetching a batch from the API when unknown.
    async fn target_for(&self, session: &Session, index: u64) -> ZkdResult<UploadTarget> {
        if let Some(target) = session.target(index) {
            return Ok(target);
        }
        let _fetching = session.target_fetch.lock().await;
        if let Some(target) = session.target(index) {
            return Ok(target);
        }

        let batch: Vec<u64> = {
            let known = session.targets();
            let confirmed = session.confirmed();
            std::iter::once(index)
                .chain(
                    session
                        .plan
                        .iter()
                        .map(|s| s.index)
                        .filter(|i| *i > index && !known.contains_key(i) && !confirmed.contains_key(i)),
                )
                .take(TARGET_BATCH)
                .collect()
        };
        let fresh = self
            .api
            .fetch_upload_targets(&session.session_id, &batch)
            .await?;
        debug!(session_id = %session.session_id, requested = batch.len(), issued = fresh.len(), "upload targets fetched");
        session.targets().extend(fresh);
        session
            .target(index)
            .ok_or_else(|| ZkdError::Storage(format!("no upload target issued for chunk {index}")))
    }

    /// Confirm chunks uploaded but not yet confirmed. Returns the plan
    /// indices still unconfirmed afterwards.
    async fn confirm(&self, session: &Session, ledger: &RunLedger) -> ZkdResult<Vec<u64>> {
        let unconfirmed: Vec<ChunkInfo> = {
            let confirmed = session.confirmed();
            ledger
                .uploaded
                .values()
                .filter(|c| !confirmed.contains_key(&c.index))
                .cloned()
                .collect()
        };

        if !unconfirmed.is_empty() {
            let (response, _) = self
                .retry
                .run(|_| self.api.confirm_chunks(&session.session_id, &unconfirmed))
                .await?;
            debug!(
                session_id = %session.session_id,
                sent = unconfirmed.len(),
                confirmed = response.confirmed.len(),
                failed = response.failed.len(),
                "chunks confirmed"
            );
            let mut confirmed = session.confirmed();
            for index in response.confirmed {
                if let Some(info) = ledger.uploaded.get(&index) {
                    confirmed.insert(index, info.clone());
                }
            }
            drop(confirmed);
        }
        Ok(session.missing())
    }

    async fn finalize(&self, session: &Session, attempts: BTreeMap<u64, u32>) -> ZkdResult<UploadReceipt> {
        let keypairs = self.keys.get_or_decrypt_user_keypairs()?;
        // same fields, same timestamp: the canonical bytes match initialization
        let signed = ManifestSigner::build_and_sign(&session.fields, &keypairs)?;
        let request = FinalizeRequest {
            manifest_hash: signed.manifest_hash.clone(),
            signatures: signed.signatures,
            manifest_created_at: session.fields.created_at,
        };
        let (response, _) = self
            .retry
            .run(|_| self.api.finalize_upload(&session.session_id, &request))
            .await?;

        if response.manifest_hash != signed.manifest_hash {
            return Err(ZkdError::ManifestMismatch {
                expected: response.manifest_hash,
                actual: signed.manifest_hash,
            });
        }

        Ok(UploadReceipt {
            object_id: response.object_id,
            session_id: session.session_id.clone(),
            name: session.name.clone(),
            size: session.fields.size,
            manifest_hash: signed.manifest_hash,
            chunks: session.confirmed().values().cloned().collect(),
            attempts,
            replaced: session.replaced.clone(),
        })
    }

    /// End a run that handed chunks to the offline queue.
    async fn deferred(
        &self,
        session: &Session,
        ledger: &RunLedger,
        control: &UploadControl,
    ) -> ZkdResult<UploadOutcome> {
        if let Err(e) = self.confirm(session, ledger).await {
            warn!(object_id = %session.object_id, "confirm before deferral failed: {e}");
        }
        control.set_state(UploadState::Deferred);
        let token = session.resume_token(ledger);
        info!(
            object_id = %session.object_id,
            queued = token.queued.len(),
            confirmed = token.confirmed.len(),
            total = session.plan.len(),
            "upload deferred to the offline queue"
        );
        Ok(UploadOutcome::Deferred(token))
    }

    /// Turn an error out of the transfer phase into the caller-facing outcome.
    async fn interrupted(
        &self,
        session: &Session,
        ledger: &RunLedger,
        control: &UploadControl,
        error: ZkdError,
    ) -> ZkdResult<UploadOutcome> {
        match control.interruption() {
            Some(Interruption::Paused) => {
                // chunks that landed before the pause become part of the token
                if let Err(e) = self.confirm(session, ledger).await {
                    warn!(object_id = %session.object_id, "confirm on pause failed: {e}");
                }
                control.set_state(UploadState::Paused);
                let token = session.resume_token(ledger);
                info!(
                    object_id = %session.object_id,
                    confirmed = token.confirmed.len(),
                    total = session.plan.len(),
                    "upload paused"
                );
                Ok(UploadOutcome::Paused(token))
            }
            Some(Interruption::Cancelled) => {
                control.set_state(UploadState::Cancelled);
                info!(object_id = %session.object_id, "upload cancelled");
                Err(ZkdError::Cancelled)
            }
            None => Err(error),
        }
    }
}

fn manifest_fields(
    cek: &Cek,
    name: &str,
    size: u64,
    options: &UploadOptions,
    created_at: u64,
) -> ZkdResult<ManifestFields> {
    let fields = ManifestFields::new(encrypt_name(cek, name)?, size, options.mime_type.clone(), created_at);
    Ok(match &options.content_hash {
        Some(hash) => fields.with_content_hash(hash.clone()),
        None => fields,
    })
}

fn spans_for(session: &Session, indices: &[u64]) -> Vec<ChunkSpan> {
    let wanted: BTreeSet<u64> = indices.iter().copied().collect();
    session
        .plan
        .iter()
        .filter(|s| wanted.contains(&s.index))
        .copied()
        .collect()
}
