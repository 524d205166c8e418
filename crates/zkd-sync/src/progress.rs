//! Progress accumulation for concurrently transferred chunks
//!
//! Chunk tasks finish in any order; they report into one shared tracker,
//! which emits events under its lock so that `bytes_completed` observed by
//! the callback never decreases. A chunk counts once, however many times
//! it is re-uploaded.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::Serialize;

/// Progress event for one object transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub object_id: String,
    pub bytes_completed: u64,
    pub total_bytes: u64,
    /// Chunk whose completion produced this event
    pub chunk_index: Option<u64>,
    /// Attempts the chunk took
    pub attempt: u32,
}

impl ProgressEvent {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_completed as f64 / self.total_bytes as f64
        }
    }
}

/// Progress callback: invoked with every event, in monotonic order
pub type ProgressFn = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

struct Accumulated {
    object_id: String,
    completed: u64,
    chunks: BTreeSet<u64>,
}

pub struct ProgressTracker {
    total: u64,
    state: Mutex<Accumulated>,
    callback: Option<ProgressFn>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total", &self.total)
            .field("completed", &self.completed())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(object_id: impl Into<String>, total: u64, callback: Option<ProgressFn>) -> Self {
        Self {
            total,
            state: Mutex::new(Accumulated {
                object_id: object_id.into(),
                completed: 0,
                chunks: BTreeSet::new(),
            }),
            callback,
        }
    }

    /// Count chunks that were already done before this run (resume).
    /// Emits a single event carrying the restored total.
    pub fn seed<I: IntoIterator<Item = (u64, u64)>>(&self, chunks: I) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for (index, bytes) in chunks {
            if state.chunks.insert(index) {
                state.completed = (state.completed + bytes).min(self.total);
            }
        }
        self.emit(&state, None, 0);
    }

    /// Record a completed chunk. Returns the new byte total.
    pub fn chunk_done(&self, index: u64, bytes: u64, attempt: u32) -> u64 {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        if state.chunks.insert(index) {
            state.completed = (state.completed + bytes).min(self.total);
        }
        self.emit(&state, Some(index), attempt);
        state.completed
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().map(|s| s.completed).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn emit(&self, state: &Accumulated, chunk_index: Option<u64>, attempt: u32) {
        if let Some(cb) = &self.callback {
            cb(&ProgressEvent {
                object_id: state.object_id.clone(),
                bytes_completed: state.completed,
                total_bytes: self.total,
                chunk_index,
                attempt,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording(total: u64) -> (ProgressTracker, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let tracker = ProgressTracker::new(
            "obj",
            total,
            Some(Box::new(move |e: &ProgressEvent| sink.lock().unwrap().push(e.clone()))),
        );
        (tracker, events)
    }

    #[test]
    fn repeated_chunk_counts_once() {
        let (t, events) = recording(10);
        assert_eq!(t.chunk_done(0, 4, 1), 4);
        assert_eq!(t.chunk_done(0, 4, 2), 4);
        assert_eq!(t.chunk_done(1, 6, 1), 10);
        let seen: Vec<u64> = events.lock().unwrap().iter().map(|e| e.bytes_completed).collect();
        assert_eq!(seen, vec![4, 4, 10]);
    }

    #[test]
    fn seed_restores_resumed_bytes() {
        let (t, events) = recording(100);
        t.seed([(0, 40), (1, 40)]);
        assert_eq!(t.completed(), 80);
        assert_eq!(events.lock().unwrap()[0].chunk_index, None);
        t.chunk_done(1, 40, 1);
        assert_eq!(t.completed(), 80);
    }

    #[test]
    fn empty_object_is_complete() {
        let e = ProgressEvent {
            object_id: "o".into(),
            bytes_completed: 0,
            total_bytes: 0,
            chunk_index: None,
            attempt: 0,
        };
        assert_eq!(e.fraction(), 1.0);
    }

    #[test]
    fn concurrent_reports_are_monotonic() {
        let (t, events) = recording(64 * 100);
        let t = Arc::new(t);
        let handles: Vec<_> = (0..64u64)
            .map(|i| {
                let t = t.clone();
                std::thread::spawn(move || {
                    t.chunk_done(i, 100, 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let seen: Vec<u64> = events.lock().unwrap().iter().map(|e| e.bytes_completed).collect();
        assert_eq!(seen.len(), 64);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 6400);
    }
}
