//! Bounded-concurrency FIFO executor for bulk chunk transfer
//!
//! Independent of any control-plane request scheduling: chunk PUTs and
//! GETs acquire slots here and nowhere else. Waiters are served strictly
//! in arrival order. The ceiling can change at runtime; queued waiters
//! are kept and woken as slots free up under the new ceiling.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use zkd_core::{ZkdError, ZkdResult};

struct State {
    limit: usize,
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct Inner {
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct TransferScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferScheduler")
            .field("concurrency", &self.concurrency())
            .field("active", &self.active())
            .field("queued", &self.queued())
            .finish()
    }
}

/// A held transfer slot, released on drop
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct TransferPermit {
    inner: Arc<Inner>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        release(&self.inner);
    }
}

/// A waiter that was granted a slot but dropped before taking it hands
/// the slot back.
struct Waiter {
    inner: Arc<Inner>,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.granted {
            self.rx.close();
            if self.rx.try_recv().is_ok() {
                release(&self.inner);
            }
        }
    }
}

fn lock(inner: &Inner) -> MutexGuard<'_, State> {
    // State stays consistent across a panic: every mutation is a single
    // counter update or queue operation.
    inner.state.lock().unwrap_or_else(|e| e.into_inner())
}

fn release(inner: &Inner) {
    let mut state = lock(inner);
    state.active = state.active.saturating_sub(1);
    drain(&mut state);
}

/// Hand free slots to queued waiters in FIFO order.
fn drain(state: &mut State) {
    while state.active < state.limit {
        let Some(tx) = state.waiters.pop_front() else {
            break;
        };
        if tx.send(()).is_ok() {
            state.active += 1;
        }
    }
}

impl TransferScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    limit: concurrency.max(1),
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> ZkdResult<TransferPermit> {
        let rx = {
            let mut state = lock(&self.inner);
            if state.active < state.limit && state.waiters.is_empty() {
                state.active += 1;
                return Ok(TransferPermit {
                    inner: self.inner.clone(),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            inner: self.inner.clone(),
            rx,
            granted: false,
        };
        match (&mut waiter.rx).await {
            Ok(()) => {
                waiter.granted = true;
                Ok(TransferPermit {
                    inner: self.inner.clone(),
                })
            }
            Err(_) => {
                waiter.granted = true;
                Err(ZkdError::Cancelled)
            }
        }
    }

    /// Run `task` once a slot is free; the slot is held until it completes.
    pub async fn enqueue<F, T>(&self, task: F) -> ZkdResult<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(task.await)
    }

    /// Change the ceiling. Running tasks are unaffected; queued waiters
    /// are woken if the ceiling grew.
    pub fn set_concurrency(&self, concurrency: usize) {
        let mut state = lock(&self.inner);
        let old = state.limit;
        state.limit = concurrency.max(1);
        drain(&mut state);
        tracing::debug!(old, new = state.limit, queued = state.waiters.len(), "transfer concurrency changed");
    }

    pub fn concurrency(&self) -> usize {
        lock(&self.inner).limit
    }

    pub fn active(&self) -> usize {
        lock(&self.inner).active
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner).waiters.len()
    }
}
