//! In-process object API and fault-injecting transport over an OpenDAL
//! memory operator.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use secrecy::SecretString;
use zkd_chunks::ProcessorPool;
use zkd_core::types::{ChunkInfo, CompressionAlgorithm, CompressionMeta, ConflictInfo, UploadTarget};
use zkd_core::{ZkdError, ZkdResult};
use zkd_crypto::{
    decrypt_name, EncryptedKeyring, KdfParams, KeyManager, KeyWrapEnvelope, ManifestFields, ManifestSigner,
    SignedManifest, UserKeypairs,
};
use zkd_storage::{
    chunk_key, BlobTransport, ConfirmResponse, DownloadChunk, DownloadSession, FinalizeRequest, FinalizeResponse,
    InitializeRequest, InitializeResponse, MetadataCommit, ObjectApi, OperatorTransport, SignedManifestRecord,
    TransferScheduler,
};
use zkd_sync::{DownloadSessionManager, RetryPolicy, UploadSessionCoordinator};

pub const MIB: u64 = 1024 * 1024;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

/// Unlocked key manager with a cheap KDF.
pub fn unlocked_keys() -> Arc<KeyManager> {
    let params = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };
    let (keyring, master, _) =
        EncryptedKeyring::create(&SecretString::from("correct horse"), &params).expect("keyring");
    let keys = Arc::new(KeyManager::new());
    keys.unlock(master, keyring);
    keys
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(10))
}

/// Deterministic, poorly compressible test payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

// ── Mock API ──────────────────────────────────────────────────────────────────

struct MockSession {
    object_id: String,
    request: Option<InitializeRequest>,
    plaintext_name: String,
    confirmed: BTreeMap<u64, ChunkInfo>,
}

struct MockObject {
    size: u64,
    mime_type: String,
    encrypted_name: String,
    envelope: KeyWrapEnvelope,
    chunks: Vec<ChunkInfo>,
    manifest: SignedManifestRecord,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    sessions: HashMap<String, MockSession>,
    objects: HashMap<String, MockObject>,
    /// plaintext name → object id
    names: HashMap<String, String>,
    replaced: Vec<String>,
    confirm_payloads: Vec<Vec<u64>>,
    commits: Vec<(String, MetadataCommit)>,
    log: Vec<String>,
}

/// Object API backed by a memory operator.
///
/// Holds the user's key manager so it can enforce name uniqueness the way a
/// backend keyed on the user's namespace would.
pub struct MockApi {
    op: Operator,
    keys: Arc<KeyManager>,
    state: Mutex<MockState>,
    /// Targets handed out at initialization (the rest via fetch)
    pub initial_targets: u64,
    pub offline: AtomicBool,
    pub finalize_hash_override: Mutex<Option<String>>,
    pub never_confirm: Mutex<HashSet<u64>>,
    pub tamper_manifest: AtomicBool,
    /// Listings leave out the signed manifest
    pub omit_manifest: AtomicBool,
    /// Listings carry altered fields re-signed under an unrelated keypair
    pub foreign_signature: AtomicBool,
    /// Listings claim chunk 0 is a zstd frame decompressing to this many bytes
    pub forged_chunk_size: Mutex<Option<u64>>,
    /// Confirm calls that apply but then report a dropped connection
    pub drop_confirm_responses: AtomicU32,
    pub download_sessions: AtomicU64,
    pub target_fetches: AtomicU64,
    pub url_refreshes: AtomicU64,
}

impl MockApi {
    pub fn new(op: Operator, keys: Arc<KeyManager>) -> Self {
        Self {
            op,
            keys,
            state: Mutex::new(MockState::default()),
            initial_targets: 2,
            offline: AtomicBool::new(false),
            finalize_hash_override: Mutex::new(None),
            never_confirm: Mutex::new(HashSet::new()),
            tamper_manifest: AtomicBool::new(false),
            omit_manifest: AtomicBool::new(false),
            foreign_signature: AtomicBool::new(false),
            forged_chunk_size: Mutex::new(None),
            drop_confirm_responses: AtomicU32::new(0),
            download_sessions: AtomicU64::new(0),
            target_fetches: AtomicU64::new(0),
            url_refreshes: AtomicU64::new(0),
        }
    }

    /// An open session not created through `initialize_session`.
    pub fn open_session(&self, session_id: &str, object_id: &str) {
        self.state.lock().unwrap().sessions.insert(
            session_id.to_string(),
            MockSession {
                object_id: object_id.to_string(),
                request: None,
                plaintext_name: String::new(),
                confirmed: BTreeMap::new(),
            },
        );
    }

    pub fn confirm_payloads(&self) -> Vec<Vec<u64>> {
        self.state.lock().unwrap().confirm_payloads.clone()
    }

    pub fn commits(&self) -> Vec<(String, MetadataCommit)> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn replaced(&self) -> Vec<String> {
        self.state.lock().unwrap().replaced.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Manifest hash recorded when `session_id` was initialized.
    pub fn initialized_hash(&self, session_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let session = state.sessions.get(session_id)?;
        session.request.as_ref().map(|r| r.manifest_hash.clone())
    }

    /// Chunk indices the backend currently holds as confirmed for `session_id`.
    pub fn confirmed_indices(&self, session_id: &str) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(session_id)
            .map(|s| s.confirmed.keys().copied().collect())
            .unwrap_or_default()
    }

    fn check_online(&self) -> ZkdResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ZkdError::NetworkTransient("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn session_object(&self, session_id: &str) -> ZkdResult<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|s| s.object_id.clone())
            .ok_or_else(|| ZkdError::Api {
                status: 404,
                message: format!("unknown session {session_id}"),
            })
    }
}

#[async_trait]
impl ObjectApi for MockApi {
    async fn initialize_session(&self, request: &InitializeRequest) -> ZkdResult<InitializeResponse> {
        self.check_online()?;
        let cek = self.keys.unwrap_cek_for_self(&request.envelope)?;
        let name = decrypt_name(&cek, &request.encrypted_name)?;

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.names.get(&name).cloned() {
            if request.replace_object_id.as_deref() != Some(existing.as_str()) {
                return Err(ZkdError::Conflict(ConflictInfo {
                    conflicting_name: request.encrypted_name.clone(),
                    existing_object_id: existing,
                    proposed_name: None,
                }));
            }
            state.replaced.push(existing);
        }

        state.next_id += 1;
        let object_id = format!("obj-{}", state.next_id);
        let session_id = format!("sess-{}", state.next_id);
        state.names.insert(name.clone(), object_id.clone());
        state.log.push(format!("initialize {object_id}"));

        let upload_targets = request
            .chunk_plan
            .iter()
            .take(self.initial_targets as usize)
            .map(|c| {
                (
                    c.index,
                    UploadTarget {
                        url: chunk_key(&object_id, c.index),
                        expected_digest: None,
                    },
                )
            })
            .collect();
        state.sessions.insert(
            session_id.clone(),
            MockSession {
                object_id: object_id.clone(),
                request: Some(request.clone()),
                plaintext_name: name,
                confirmed: BTreeMap::new(),
            },
        );
        Ok(InitializeResponse {
            session_id,
            object_id,
            upload_targets,
        })
    }

    async fn fetch_upload_targets(
        &self,
        session_id: &str,
        indices: &[u64],
    ) -> ZkdResult<BTreeMap<u64, UploadTarget>> {
        self.check_online()?;
        self.target_fetches.fetch_add(1, Ordering::SeqCst);
        let object_id = self.session_object(session_id)?;
        self.state
            .lock()
            .unwrap()
            .log
            .push(format!("targets {session_id} {indices:?}"));
        Ok(indices
            .iter()
            .map(|i| {
                (
                    *i,
                    UploadTarget {
                        url: chunk_key(&object_id, *i),
                        expected_digest: None,
                    },
                )
            })
            .collect())
    }

    async fn confirm_chunks(&self, session_id: &str, chunks: &[ChunkInfo]) -> ZkdResult<ConfirmResponse> {
        self.check_online()?;
        let object_id = self.session_object(session_id)?;
        let refused = self.never_confirm.lock().unwrap().clone();

        let mut present = Vec::new();
        for chunk in chunks {
            let stored = self.op.stat(&chunk_key(&object_id, chunk.index)).await.is_ok();
            present.push((chunk.clone(), stored && !refused.contains(&chunk.index)));
        }

        let mut state = self.state.lock().unwrap();
        state
            .confirm_payloads
            .push(chunks.iter().map(|c| c.index).collect());
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ZkdError::Api {
                status: 404,
                message: "session vanished".into(),
            })?;
        let mut response = ConfirmResponse::default();
        for (chunk, ok) in present {
            if ok {
                response.confirmed.push(chunk.index);
                session.confirmed.insert(chunk.index, chunk);
            } else {
                response.failed.push(chunk.index);
            }
        }
        drop(state);
        let dropped = self
            .drop_confirm_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(ZkdError::NetworkTransient("connection reset after confirm".into()));
        }
        Ok(response)
    }

    async fn finalize_upload(&self, session_id: &str, request: &FinalizeRequest) -> ZkdResult<FinalizeResponse> {
        self.check_online()?;
        let override_hash = self.finalize_hash_override.lock().unwrap().clone();

        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get(session_id).ok_or_else(|| ZkdError::Api {
            status: 404,
            message: format!("unknown session {session_id}"),
        })?;
        let init = session.request.clone().ok_or_else(|| ZkdError::Api {
            status: 409,
            message: "session has no initialization".into(),
        })?;
        if session.confirmed.len() != init.chunk_plan.len() {
            return Err(ZkdError::Api {
                status: 409,
                message: "unconfirmed chunks".into(),
            });
        }
        if request.manifest_hash != init.manifest_hash {
            return Err(ZkdError::Api {
                status: 400,
                message: "manifest hash differs from initialization".into(),
            });
        }

        let object_id = session.object_id.clone();
        let mut fields = ManifestFields::new(
            init.encrypted_name.clone(),
            init.size,
            init.mime_type.clone(),
            init.manifest_created_at,
        );
        if let Some(hash) = &init.content_hash {
            fields = fields.with_content_hash(hash.clone());
        }
        let object = MockObject {
            size: init.size,
            mime_type: init.mime_type.clone(),
            encrypted_name: init.encrypted_name.clone(),
            envelope: init.envelope.clone(),
            chunks: session.confirmed.values().cloned().collect(),
            manifest: SignedManifestRecord {
                fields,
                signed: SignedManifest {
                    manifest_hash: init.manifest_hash.clone(),
                    signatures: request.signatures.clone(),
                },
            },
        };
        state.objects.insert(object_id.clone(), object);
        state.log.push(format!("finalize {object_id}"));

        Ok(FinalizeResponse {
            object_id,
            manifest_hash: override_hash.unwrap_or(init.manifest_hash),
        })
    }

    async fn get_download_session(&self, object_id: &str) -> ZkdResult<DownloadSession> {
        self.check_online()?;
        self.download_sessions.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let object = state.objects.get(object_id).ok_or_else(|| ZkdError::Api {
            status: 404,
            message: format!("unknown object {object_id}"),
        })?;
        let mut manifest = object.manifest.clone();
        let mut mime_type = object.mime_type.clone();
        if self.tamper_manifest.load(Ordering::SeqCst) {
            manifest.fields.mime_type = "text/html".into();
        }
        if self.foreign_signature.load(Ordering::SeqCst) {
            // a consistent listing, validly signed, just not by the owner
            mime_type = "text/html".into();
            manifest.fields.mime_type = mime_type.clone();
            let intruder = UserKeypairs::generate()?;
            manifest.signed = ManifestSigner::build_and_sign(&manifest.fields, &intruder)?;
        }
        let mut chunks: Vec<DownloadChunk> = object
            .chunks
            .iter()
            .map(|c| DownloadChunk {
                info: c.clone(),
                url: chunk_key(object_id, c.index),
            })
            .collect();
        if let Some(forged) = *self.forged_chunk_size.lock().unwrap() {
            if let Some(first) = chunks.first_mut() {
                first.info.plaintext_size = forged;
                first.info.compression = Some(CompressionMeta {
                    algorithm: CompressionAlgorithm::Zstd,
                    original_size: forged,
                    compressed_size: first.info.encrypted_size.saturating_sub(16),
                });
            }
        }
        let omit = self.omit_manifest.load(Ordering::SeqCst);
        Ok(DownloadSession {
            object_id: object_id.to_string(),
            declared_size: object.size,
            mime_type,
            encrypted_name: Some(object.encrypted_name.clone()),
            chunks,
            envelope: object.envelope.clone(),
            manifest: (!omit).then_some(manifest),
        })
    }

    async fn refresh_chunk_urls(&self, object_id: &str, indices: &[u64]) -> ZkdResult<BTreeMap<u64, String>> {
        self.check_online()?;
        self.url_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(indices.iter().map(|i| (*i, chunk_key(object_id, *i))).collect())
    }

    async fn commit_metadata(&self, object_id: &str, commit: &MetadataCommit) -> ZkdResult<()> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("commit {object_id}"));
        state.commits.push((object_id.to_string(), commit.clone()));
        Ok(())
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Memory-backed transport with scripted failures and latency.
pub struct FaultyTransport {
    inner: OperatorTransport,
    /// chunk index → remaining failing PUTs
    put_failures: Mutex<HashMap<u64, u32>>,
    /// keys whose next GET reports an expired URL
    expire_next_get: Mutex<HashSet<String>>,
    get_delay: Mutex<Duration>,
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    put_keys: Mutex<Vec<String>>,
}

fn index_of(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.parse().ok()
}

impl FaultyTransport {
    pub fn new(op: Operator) -> Self {
        Self {
            inner: OperatorTransport::new(op),
            put_failures: Mutex::new(HashMap::new()),
            expire_next_get: Mutex::new(HashSet::new()),
            get_delay: Mutex::new(Duration::ZERO),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            put_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_puts(&self, index: u64, times: u32) {
        self.put_failures.lock().unwrap().insert(index, times);
    }

    pub fn expire_next_get(&self, key: String) {
        self.expire_next_get.lock().unwrap().insert(key);
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = delay;
    }

    pub fn put_keys(&self) -> Vec<String> {
        self.put_keys.lock().unwrap().clone()
    }

    pub fn reset_counters(&self) {
        self.puts.store(0, Ordering::SeqCst);
        self.gets.store(0, Ordering::SeqCst);
        self.put_keys.lock().unwrap().clear();
    }
}

#[async_trait]
impl BlobTransport for FaultyTransport {
    async fn put(&self, target: &UploadTarget, body: Bytes, content_digest: &str) -> ZkdResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(index) = index_of(&target.url) {
            let mut failures = self.put_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&index) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ZkdError::NetworkTransient("HTTP 500".into()));
                }
            }
        }
        self.put_keys.lock().unwrap().push(target.url.clone());
        self.inner.put(target, body, content_digest).await
    }

    async fn get(&self, url: &str) -> ZkdResult<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.expire_next_get.lock().unwrap().remove(url) {
            return Err(ZkdError::UrlExpired);
        }
        self.inner.get(url).await
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub op: Operator,
    pub keys: Arc<KeyManager>,
    pub api: Arc<MockApi>,
    pub transport: Arc<FaultyTransport>,
    pub pool: Arc<ProcessorPool>,
    pub scheduler: TransferScheduler,
}

impl Harness {
    pub fn new() -> Self {
        let op = memory_operator();
        let keys = unlocked_keys();
        Self {
            api: Arc::new(MockApi::new(op.clone(), keys.clone())),
            transport: Arc::new(FaultyTransport::new(op.clone())),
            pool: Arc::new(ProcessorPool::new(2).expect("pool")),
            scheduler: TransferScheduler::new(4),
            op,
            keys,
        }
    }

    pub fn coordinator(&self) -> UploadSessionCoordinator {
        UploadSessionCoordinator::new(
            self.api.clone(),
            self.transport.clone(),
            self.keys.clone(),
            self.pool.clone(),
            self.scheduler.clone(),
        )
        .with_retry(fast_retry())
        .with_concurrency(3)
    }

    pub fn downloads(&self) -> DownloadSessionManager {
        DownloadSessionManager::new(
            self.api.clone(),
            self.transport.clone(),
            self.keys.clone(),
            self.pool.clone(),
            self.scheduler.clone(),
        )
        .with_retry(fast_retry())
    }
}
