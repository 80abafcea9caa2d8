//! Retry policy for origin fetches.

use crate::error::{ArchiveError, ArchiveResult, ErrorClass};
use hoard_core::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_retry2::strategy::jitter;
use tokio_retry2::{Retry, RetryError};
use tracing::debug;

/// Bounded exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            jitter: config.jitter,
        }
    }

    /// Delays between attempts: `base * 2^n`, capped at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        let (base, max, use_jitter) = (self.base_delay, self.max_delay, self.jitter);
        (0..self.max_attempts.saturating_sub(1)).map(move |n| {
            let delay = base.saturating_mul(2u32.saturating_pow(n)).min(max);
            if use_jitter { jitter(delay) } else { delay }
        })
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. `op` receives the 1-based attempt number.
    ///
    /// A `Retry-After` from the origin replaces the next backoff delay, capped
    /// at `max_delay`.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> ArchiveResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        let max_delay = self.max_delay;
        let mut attempt = 0u32;
        Retry::spawn(self.delays(), || {
            attempt += 1;
            let current = attempt;
            let fut = op(current);
            async move {
                fut.await.map_err(|err| match err.class() {
                    ErrorClass::Transient => {
                        debug!(attempt = current, error = %err, "transient failure, will retry");
                        let retry_after = err.retry_after().map(|d| d.min(max_delay));
                        RetryError::Transient { err, retry_after }
                    }
                    _ => RetryError::Permanent(err),
                })
            }
        })
        .await
    }
}
