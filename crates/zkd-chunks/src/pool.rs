//! CPU-bound worker pool for chunk processing
//!
//! Requests are tagged with a request id and handed to a rayon pool; each
//! worker posts its response to the pending entry for that id. Many
//! requests may be in flight at once and complete in any order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use zkd_core::types::ChunkInfo;
use zkd_core::{ZkdError, ZkdResult};

use crate::processor::{ChunkProcessor, ProcessedChunk};

/// Work accepted by the pool
pub enum ProcessRequest {
    Encrypt {
        processor: Arc<ChunkProcessor>,
        index: u64,
        plaintext: Vec<u8>,
    },
    Decrypt {
        processor: Arc<ChunkProcessor>,
        info: ChunkInfo,
        ciphertext: Vec<u8>,
    },
}

#[derive(Debug)]
pub enum ProcessResponse {
    Encrypted(ProcessedChunk),
    Decrypted(Vec<u8>),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ZkdResult<ProcessResponse>>>>>;

pub struct ProcessorPool {
    pool: Mutex<Option<Arc<rayon::ThreadPool>>>,
    pending: Pending,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ProcessorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPool")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ProcessorPool {
    /// Build a pool; `threads == 0` sizes it to the available cores.
    pub fn new(threads: usize) -> ZkdResult<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("zkd-chunk-{i}"))
            .panic_handler(|_| tracing::error!("chunk worker panicked outside a request"))
            .build()
            .map_err(|e| ZkdError::Other(anyhow::anyhow!("building chunk pool: {e}")))?;
        tracing::debug!(threads, "chunk processor pool started");
        Ok(Self {
            pool: Mutex::new(Some(Arc::new(pool))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Number of requests awaiting a response
    pub fn in_flight(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Submit a request and wait for its response.
    ///
    /// Fails with `Cancelled` once the pool has been shut down, including
    /// for requests that were queued when shutdown happened.
    pub async fn submit(&self, request: ProcessRequest) -> ZkdResult<ProcessResponse> {
        let pool = self
            .pool
            .lock()
            .ok()
            .and_then(|p| p.clone())
            .ok_or(ZkdError::Cancelled)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| ZkdError::Other(anyhow::anyhow!("chunk pool state poisoned")))?
            .insert(id, tx);

        let pending = self.pending.clone();
        pool.spawn(move || {
            let result = guarded(id, || match request {
                ProcessRequest::Encrypt {
                    processor,
                    index,
                    plaintext,
                } => processor.process(index, &plaintext).map(ProcessResponse::Encrypted),
                ProcessRequest::Decrypt {
                    processor,
                    info,
                    ciphertext,
                } => processor
                    .restore(&info, &ciphertext)
                    .map(ProcessResponse::Decrypted),
            });
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
            if let Some(tx) = waiter {
                let _ = tx.send(result);
            }
        });

        rx.await.map_err(|_| ZkdError::Cancelled)?
    }

    pub async fn encrypt(
        &self,
        processor: Arc<ChunkProcessor>,
        index: u64,
        plaintext: Vec<u8>,
    ) -> ZkdResult<ProcessedChunk> {
        match self
            .submit(ProcessRequest::Encrypt {
                processor,
                index,
                plaintext,
            })
            .await?
        {
            ProcessResponse::Encrypted(chunk) => Ok(chunk),
            ProcessResponse::Decrypted(_) => Err(unexpected_response(index)),
        }
    }

    pub async fn decrypt(
        &self,
        processor: Arc<ChunkProcessor>,
        info: ChunkInfo,
        ciphertext: Vec<u8>,
    ) -> ZkdResult<Vec<u8>> {
        let index = info.index;
        match self
            .submit(ProcessRequest::Decrypt {
                processor,
                info,
                ciphertext,
            })
            .await?
        {
            ProcessResponse::Decrypted(plain) => Ok(plain),
            ProcessResponse::Encrypted(_) => Err(unexpected_response(index)),
        }
    }

    /// Stop accepting work and fail every outstanding request with `Cancelled`.
    pub fn shutdown(&self) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.take();
        }
        let dropped = self
            .pending
            .lock()
            .map(|mut p| {
                let n = p.len();
                p.clear();
                n
            })
            .unwrap_or(0);
        tracing::debug!(dropped, "chunk processor pool shut down");
    }
}

/// Run one request, turning a panic into an error for that request alone.
fn guarded<T>(id: u64, work: impl FnOnce() -> ZkdResult<T>) -> ZkdResult<T> {
    catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|panic| {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        tracing::error!(request = id, %reason, "chunk request panicked");
        Err(ZkdError::Other(anyhow::anyhow!("chunk request {id} panicked: {reason}")))
    })
}

fn unexpected_response(index: u64) -> ZkdError {
    ZkdError::Other(anyhow::anyhow!("chunk {index}: mismatched pool response"))
}
