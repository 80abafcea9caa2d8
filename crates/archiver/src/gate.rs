//! Process-wide rate gate for origin requests.
//!
//! Combines a GCRA token bucket (governor) with a Tokio semaphore bounding
//! requests in flight. Callers over the limit wait; nothing is rejected.

use crate::error::{ArchiveError, ArchiveResult};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hoard_core::config::RateLimitConfig;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared limiter; clones share the same bucket and semaphore.
#[derive(Clone)]
pub struct RateGate {
    limiter: Arc<DirectRateLimiter>,
    in_flight: Arc<Semaphore>,
}

/// Holds one concurrency slot until dropped.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateGate {
    pub fn new(config: &RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.requests_per_interval).unwrap_or(NonZeroU32::MIN);
        let period = config.interval() / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            in_flight: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        }
    }

    /// Wait for a request token, then for a concurrency slot.
    pub async fn acquire(&self) -> ArchiveResult<GatePermit> {
        self.limiter.until_ready().await;

        // Taken last so a slot is not held while waiting on the bucket.
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ArchiveError::Cancelled)?;
        Ok(GatePermit { _permit: permit })
    }
}
