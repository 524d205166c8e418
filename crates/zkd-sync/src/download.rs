//! Download sessions and decrypting byte-range reads
//!
//! An object is registered once per manager: the listing call, manifest
//! verification, CEK unwrap and chunk map all happen a single time, and
//! concurrent registrations of the same object wait on the first. Range
//! reads then fetch only the chunks overlapping the requested span; a
//! chunk already being fetched for another reader is awaited rather than
//! fetched again.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use zkd_chunks::{ChunkProcessor, CompressionDecision, ProcessorPool};
use zkd_core::config::TransferConfig;
use zkd_core::types::{ChunkInfo, MAX_CHUNK_BYTES};
use zkd_core::{ZkdError, ZkdResult};
use zkd_crypto::{decrypt_name, KeyManager, ManifestSigner, PublicKeys, AEAD_OVERHEAD};
use zkd_storage::{BlobTransport, DownloadSession, ObjectApi, TransferScheduler};

use crate::retry::RetryPolicy;

/// How far the mapped size may drift from the declared size and still be
/// snapped to it
pub const SIZE_SNAP_TOLERANCE: u64 = 64;

/// Plaintext span covered by one chunk: `[plaintext_start, plaintext_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMapEntry {
    pub index: u64,
    pub plaintext_start: u64,
    pub plaintext_end: u64,
    pub encrypted_size: u64,
}

impl ChunkMapEntry {
    pub fn len(&self) -> u64 {
        self.plaintext_end - self.plaintext_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this chunk holds any byte of the inclusive range `[start, end]`.
    fn overlaps(&self, start: u64, end: u64) -> bool {
        !self.is_empty() && self.plaintext_start <= end && self.plaintext_end > start
    }
}

/// Walk `chunks` in index order accumulating plaintext offsets.
///
/// A chunk's plaintext length is its compression `original_size` when
/// compressed, else its ciphertext length minus the AEAD tag. The final
/// entry is snapped to `declared_size` when within [`SIZE_SNAP_TOLERANCE`];
/// a larger disagreement is an error. Chunks above [`MAX_CHUNK_BYTES`] and
/// offsets that overflow are rejected as protocol violations.
pub fn build_chunk_map(chunks: &[ChunkInfo], declared_size: u64) -> ZkdResult<Vec<ChunkMapEntry>> {
    let mut sorted: Vec<&ChunkInfo> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.index);
    for (expected, chunk) in sorted.iter().enumerate() {
        if chunk.index != expected as u64 {
            return Err(ZkdError::Protocol(format!(
                "chunk list is not contiguous: expected index {expected}, found {}",
                chunk.index
            )));
        }
    }

    let mut offset = 0u64;
    let mut map = Vec::with_capacity(sorted.len());
    for chunk in sorted {
        let len = match &chunk.compression {
            Some(meta) => meta.original_size,
            None => chunk.encrypted_size.saturating_sub(AEAD_OVERHEAD),
        };
        if len > MAX_CHUNK_BYTES {
            return Err(ZkdError::Protocol(format!(
                "chunk {} claims {len} plaintext bytes",
                chunk.index
            )));
        }
        let end = offset.checked_add(len).ok_or_else(|| {
            ZkdError::Protocol(format!("chunk {} overflows the object offset", chunk.index))
        })?;
        map.push(ChunkMapEntry {
            index: chunk.index,
            plaintext_start: offset,
            plaintext_end: end,
            encrypted_size: chunk.encrypted_size,
        });
        offset = end;
    }

    if let Some(last) = map.last_mut() {
        if offset != declared_size {
            if offset.abs_diff(declared_size) > SIZE_SNAP_TOLERANCE || declared_size < last.plaintext_start {
                return Err(ZkdError::ManifestMismatch {
                    expected: format!("{declared_size} bytes"),
                    actual: format!("{offset} bytes in chunk map"),
                });
            }
            debug!(mapped = offset, declared_size, "snapping final chunk to declared size");
            last.plaintext_end = declared_size;
        }
    } else if declared_size != 0 {
        return Err(ZkdError::ManifestMismatch {
            expected: format!("{declared_size} bytes"),
            actual: "no chunks".into(),
        });
    }
    Ok(map)
}

/// A registered object: everything range reads need, built once.
struct RegisteredObject {
    object_id: String,
    declared_size: u64,
    mime_type: String,
    name: Option<String>,
    chunks: BTreeMap<u64, ChunkInfo>,
    map: Vec<ChunkMapEntry>,
    urls: Mutex<BTreeMap<u64, String>>,
    processor: Arc<ChunkProcessor>,
}

impl RegisteredObject {
    fn urls(&self) -> MutexGuard<'_, BTreeMap<u64, String>> {
        self.urls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read-only view of a registered object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub object_id: String,
    pub declared_size: u64,
    pub mime_type: String,
    /// Decrypted object name, when the listing carried one
    pub name: Option<String>,
    pub chunk_count: usize,
}

type ChunkFetch = Shared<BoxFuture<'static, Result<Bytes, Arc<ZkdError>>>>;

struct Inner {
    api: Arc<dyn ObjectApi>,
    transport: Arc<dyn BlobTransport>,
    keys: Arc<KeyManager>,
    pool: Arc<ProcessorPool>,
    scheduler: TransferScheduler,
    retry: RetryPolicy,
    window: u64,
    objects: Mutex<HashMap<String, Arc<OnceCell<Arc<RegisteredObject>>>>>,
    in_flight: Mutex<HashMap<(String, u64), ChunkFetch>>,
    registrations: AtomicU64,
    chunk_fetches: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of download sessions and the range-read front end over them.
///
/// Cheap to clone; clones share registrations and in-flight fetches.
#[derive(Clone)]
pub struct DownloadSessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSessionManager")
            .field("objects", &lock(&self.inner.objects).len())
            .field("in_flight", &lock(&self.inner.in_flight).len())
            .field("window", &self.inner.window)
            .finish()
    }
}

impl DownloadSessionManager {
    pub fn new(
        api: Arc<dyn ObjectApi>,
        transport: Arc<dyn BlobTransport>,
        keys: Arc<KeyManager>,
        pool: Arc<ProcessorPool>,
        scheduler: TransferScheduler,
    ) -> Self {
        Self::with_config(api, transport, keys, pool, scheduler, &TransferConfig::default())
    }

    pub fn with_config(
        api: Arc<dyn ObjectApi>,
        transport: Arc<dyn BlobTransport>,
        keys: Arc<KeyManager>,
        pool: Arc<ProcessorPool>,
        scheduler: TransferScheduler,
        cfg: &TransferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                transport,
                keys,
                pool,
                scheduler,
                retry: RetryPolicy::from_config(cfg),
                window: cfg.stream_window_bytes.max(1),
                objects: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                registrations: AtomicU64::new(0),
                chunk_fetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.retry = retry;
                Self { inner: Arc::new(inner) }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Register `object_id`. Idempotent; concurrent calls share one
    /// registration. A failed registration is not cached.
    pub async fn register(&self, object_id: &str) -> ZkdResult<()> {
        self.registered(object_id).await.map(|_| ())
    }

    pub async fn summary(&self, object_id: &str) -> ZkdResult<ObjectSummary> {
        let obj = self.registered(object_id).await?;
        Ok(ObjectSummary {
            object_id: obj.object_id.clone(),
            declared_size: obj.declared_size,
            mime_type: obj.mime_type.clone(),
            name: obj.name.clone(),
            chunk_count: obj.map.len(),
        })
    }

    pub async fn chunk_map(&self, object_id: &str) -> ZkdResult<Vec<ChunkMapEntry>> {
        Ok(self.registered(object_id).await?.map.clone())
    }

    /// Decrypted bytes `[start, end]` (inclusive) of `object_id`.
    ///
    /// Without `end`, one streaming window from `start`. The end is clamped
    /// to the object size; `start` at or past the end of the object is
    /// `RangeNotSatisfiable`.
    pub async fn fetch_range(&self, object_id: &str, start: u64, end: Option<u64>) -> ZkdResult<Bytes> {
        let obj = self.registered(object_id).await?;
        let size = obj.declared_size;
        if start >= size {
            return Err(ZkdError::RangeNotSatisfiable { start, size });
        }
        let end = end
            .unwrap_or_else(|| start.saturating_add(self.inner.window - 1))
            .min(size - 1);
        if end < start {
            return Err(ZkdError::RangeNotSatisfiable { start, size });
        }

        let needed: Vec<ChunkMapEntry> = obj
            .map
            .iter()
            .filter(|e| e.overlaps(start, end))
            .copied()
            .collect();
        debug!(object_id, start, end, chunks = needed.len(), "range read");

        let plaintexts =
            futures::future::try_join_all(needed.iter().map(|e| self.chunk_plaintext(&obj, e.index))).await?;

        let mut out = BytesMut::with_capacity((end - start + 1) as usize);
        for (entry, plain) in needed.iter().zip(plaintexts) {
            let from = (start.max(entry.plaintext_start) - entry.plaintext_start) as usize;
            let to = ((end + 1).min(entry.plaintext_end) - entry.plaintext_start) as usize;
            if plain.len() < to {
                return Err(ZkdError::DecryptionFailed(format!(
                    "chunk {} decrypted to {} bytes, map expects at least {to}",
                    entry.index,
                    plain.len()
                )));
            }
            out.extend_from_slice(&plain[from..to]);
        }
        Ok(out.freeze())
    }

    /// The whole object.
    pub async fn fetch_all(&self, object_id: &str) -> ZkdResult<Bytes> {
        let obj = self.registered(object_id).await?;
        if obj.declared_size == 0 {
            return Ok(Bytes::new());
        }
        self.fetch_range(object_id, 0, Some(obj.declared_size - 1)).await
    }

    /// Drop a registration; the next read registers again.
    pub fn unregister(&self, object_id: &str) {
        lock(&self.inner.objects).remove(object_id);
        lock(&self.inner.in_flight).retain(|(id, _), _| id != object_id);
    }

    /// Drop every registration and in-flight fetch handle.
    pub fn clear(&self) {
        lock(&self.inner.objects).clear();
        lock(&self.inner.in_flight).clear();
    }

    /// Registrations that actually ran (listing + unwrap)
    pub fn registrations(&self) -> u64 {
        self.inner.registrations.load(Ordering::Relaxed)
    }

    /// Chunk downloads started (excludes reads served by a shared fetch)
    pub fn chunk_fetches(&self) -> u64 {
        self.inner.chunk_fetches.load(Ordering::Relaxed)
    }

    async fn registered(&self, object_id: &str) -> ZkdResult<Arc<RegisteredObject>> {
        let cell = lock(&self.inner.objects)
            .entry(object_id.to_string())
            .or_default()
            .clone();
        let obj = cell
            .get_or_try_init(|| Self::load(self.inner.clone(), object_id.to_string()))
            .await?;
        Ok(obj.clone())
    }

    async fn load(inner: Arc<Inner>, object_id: String) -> ZkdResult<Arc<RegisteredObject>> {
        inner.registrations.fetch_add(1, Ordering::Relaxed);
        let (session, _) = inner
            .retry
            .run(|_| inner.api.get_download_session(&object_id))
            .await?;
        verify_manifest(&session, &inner.keys.public_keys()?)?;

        let map = build_chunk_map(
            &session.chunks.iter().map(|c| c.info.clone()).collect::<Vec<_>>(),
            session.declared_size,
        )?;
        let cek = Arc::new(inner.keys.unwrap_cek_for_self(&session.envelope)?);
        let name = session
            .encrypted_name
            .as_deref()
            .map(|n| decrypt_name(&cek, n))
            .transpose()?;

        let mut chunks = BTreeMap::new();
        let mut urls = BTreeMap::new();
        for chunk in session.chunks {
            urls.insert(chunk.info.index, chunk.url);
            chunks.insert(chunk.info.index, chunk.info);
        }

        info!(
            object_id = %session.object_id,
            size = session.declared_size,
            chunks = map.len(),
            "download session registered"
        );
        Ok(Arc::new(RegisteredObject {
            processor: Arc::new(ChunkProcessor::new(
                session.object_id.clone(),
                cek,
                CompressionDecision::Skip,
            )),
            object_id: session.object_id,
            declared_size: session.declared_size,
            mime_type: session.mime_type,
            name,
            chunks,
            map,
            urls: Mutex::new(urls),
        }))
    }

    /// Decrypted plaintext of one chunk, sharing any fetch already in flight.
    async fn chunk_plaintext(&self, obj: &Arc<RegisteredObject>, index: u64) -> ZkdResult<Bytes> {
        let key = (obj.object_id.clone(), index);
        let fetch = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let fut = Self::fetch_chunk(self.inner.clone(), obj.clone(), index)
                        .map(|r| r.map_err(Arc::new))
                        .boxed()
                        .shared();
                    in_flight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };

        let result = fetch.clone().await;
        {
            let mut in_flight = lock(&self.inner.in_flight);
            // only remove our own entry, not a newer fetch for the same chunk
            if in_flight.get(&key).is_some_and(|f| f.ptr_eq(&fetch)) {
                in_flight.remove(&key);
            }
        }
        result.map_err(|e| e.duplicate())
    }

    async fn fetch_chunk(inner: Arc<Inner>, obj: Arc<RegisteredObject>, index: u64) -> ZkdResult<Bytes> {
        inner.chunk_fetches.fetch_add(1, Ordering::Relaxed);
        let info = obj
            .chunks
            .get(&index)
            .cloned()
            .ok_or_else(|| ZkdError::Storage(format!("chunk {index} not in download session")))?;

        let (ciphertext, attempts) = inner
            .retry
            .run(|_| {
                let inner = &inner;
                let obj = &obj;
                async move {
                    let url = obj
                        .urls()
                        .get(&index)
                        .cloned()
                        .ok_or_else(|| ZkdError::Storage(format!("no URL for chunk {index}")))?;
                    match inner.scheduler.enqueue(inner.transport.get(&url)).await? {
                        Err(ZkdError::UrlExpired) => {
                            let fresh = inner.api.refresh_chunk_urls(&obj.object_id, &[index]).await?;
                            debug!(object_id = %obj.object_id, index, "chunk URL refreshed");
                            obj.urls().extend(fresh);
                            Err(ZkdError::UrlExpired)
                        }
                        other => other,
                    }
                }
            })
            .await?;
        if attempts > 1 {
            warn!(object_id = %obj.object_id, index, attempts, "chunk fetch needed retries");
        }

        let plain = inner
            .pool
            .decrypt(obj.processor.clone(), info, ciphertext.to_vec())
            .await?;
        Ok(Bytes::from(plain))
    }
}

/// Verify the signed manifest against the owner's own public keys.
///
/// Objects are only ever signed by their owner, so a listing without a
/// manifest, or one signed by any other key, is rejected.
fn verify_manifest(session: &DownloadSession, owner: &PublicKeys) -> ZkdResult<()> {
    let record = session.manifest.as_ref().ok_or_else(|| {
        ZkdError::SignatureInvalid(format!("object {} has no signed manifest", session.object_id))
    })?;
    if record.fields.size != session.declared_size {
        return Err(ZkdError::ManifestMismatch {
            expected: format!("{} bytes (signed)", record.fields.size),
            actual: format!("{} bytes (declared)", session.declared_size),
        });
    }
    if record.fields.mime_type != session.mime_type {
        return Err(ZkdError::ManifestMismatch {
            expected: record.fields.mime_type.clone(),
            actual: session.mime_type.clone(),
        });
    }
    if let Some(name) = &session.encrypted_name {
        if *name != record.fields.name {
            return Err(ZkdError::ManifestMismatch {
                expected: record.fields.name.clone(),
                actual: name.clone(),
            });
        }
    }
    ManifestSigner::verify_fields(&record.fields, &record.signed, owner)
}

#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    fn raw_chunk(index: u64, plaintext: u64) -> ChunkInfo {
        ChunkInfo {
            index,
            plaintext_size: plaintext,
            encrypted_size: plaintext + AEAD_OVERHEAD,
            nonce: vec![0; 24],
            integrity_digest: String::new(),
            compression: None,
        }
    }

    proptest! {
        #[test]
        fn map_is_contiguous_and_exact(sizes in prop::collection::vec(1u64..10_000, 1..40)) {
            let chunks: Vec<ChunkInfo> = sizes.iter().enumerate().map(|(i, s)| raw_chunk(i as u64, *s)).collect();
            let total: u64 = sizes.iter().sum();
            let map = build_chunk_map(&chunks, total).unwrap();

            prop_assert_eq!(map[0].plaintext_start, 0);
            for pair in map.windows(2) {
                prop_assert_eq!(pair[0].plaintext_end, pair[1].plaintext_start);
            }
            prop_assert_eq!(map.last().unwrap().plaintext_end, total);
        }

        #[test]
        fn small_drift_snaps(sizes in prop::collection::vec(100u64..10_000, 1..10), drift in 0u64..=SIZE_SNAP_TOLERANCE) {
            let chunks: Vec<ChunkInfo> = sizes.iter().enumerate().map(|(i, s)| raw_chunk(i as u64, *s)).collect();
            let declared = sizes.iter().sum::<u64>() - drift;
            let map = build_chunk_map(&chunks, declared).unwrap();
            prop_assert_eq!(map.last().unwrap().plaintext_end, declared);
        }
    }
}
