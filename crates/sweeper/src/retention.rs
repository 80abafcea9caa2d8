//! Retention and grace-period rules.

use hoard_core::ManifestEntry;
use hoard_core::config::RetentionConfig;
use time::{Duration, OffsetDateTime};

/// Factor applied to the grace period for files whose age is unknown.
pub const UNKNOWN_AGE_GRACE_FACTOR: i32 = 7;

/// Which stored entries are past retention.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_total_bytes: Option<u64>,
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            max_age: config.max_age(),
            max_total_bytes: config.max_total_bytes,
        }
    }

    /// Entries created before this instant are past `max_age`.
    ///
    /// `None` when no age limit is set or the limit reaches back past the
    /// earliest representable date, so nothing can be old enough.
    pub fn age_cutoff(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.max_age.and_then(|age| now.checked_sub(age))
    }

    pub fn is_expired(&self, entry: &ManifestEntry, now: OffsetDateTime) -> bool {
        self.age_cutoff(now)
            .is_some_and(|cutoff| entry.created_at < cutoff)
    }

    /// Bytes to free so the stored total fits under `max_total_bytes`.
    pub fn excess_bytes(&self, stored_bytes: u64) -> u64 {
        match self.max_total_bytes {
            Some(limit) => stored_bytes.saturating_sub(limit),
            None => 0,
        }
    }
}

/// Age of a file for grace-period checks.
///
/// A file without a modification time is assumed to be
/// `UNKNOWN_AGE_GRACE_FACTOR` grace periods old.
pub fn file_age(
    last_modified: Option<OffsetDateTime>,
    now: OffsetDateTime,
    grace: Duration,
) -> Duration {
    match last_modified {
        Some(at) => now - at,
        None => grace.saturating_mul(UNKNOWN_AGE_GRACE_FACTOR),
    }
}
