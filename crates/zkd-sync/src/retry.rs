//! Exponential backoff shared by chunk transfer, confirm and queue replay
//!
//! Delay before retry `n` (zero-based) is `min(cap, base * 2^n)`. Only
//! errors for which [`ZkdError::is_retryable`] holds are retried; everything
//! else is returned on the attempt that produced it.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use zkd_core::config::{QueueConfig, TransferConfig};
use zkd_core::{ZkdError, ZkdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap: cap.max(base),
        }
    }

    /// Chunk transfer policy from `[transfer]`.
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self::new(
            cfg.max_chunk_retries,
            Duration::from_millis(cfg.retry_base_ms),
            Duration::from_millis(cfg.retry_max_ms),
        )
    }

    /// Queue replay backoff from `[queue]`. Replay never gives up on an
    /// item, so only the delay curve matters.
    pub fn for_queue(cfg: &QueueConfig) -> Self {
        Self::new(
            u32::MAX,
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }

    /// Backoff after `retries` failed attempts.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. On success, returns the
    /// value together with the number of attempts it took.
    pub async fn run<T, F, Fut>(&self, op: F) -> ZkdResult<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ZkdResult<T>>,
    {
        self.run_until_cancelled(&CancellationToken::new(), op).await
    }

    /// Like [`run`](Self::run), but a cancelled `token` cuts a backoff wait
    /// short with `Cancelled`.
    pub async fn run_until_cancelled<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> ZkdResult<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ZkdResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(attempt, max = self.max_attempts, ?delay, "retrying after: {e}");
                    tokio::select! {
                        _ = token.cancelled() => return Err(ZkdError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
