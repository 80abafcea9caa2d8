//! Entry discovery, lookup and scan repository.

use crate::error::MetadataResult;
use crate::models::SourceRow;
use crate::scan::{ScanCursor, ScanPage};
use async_trait::async_trait;
use hoard_core::{ContentId, EntryStatus, ManifestEntry, SourceRef};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Result of registering a discovered source reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub content_id: ContentId,
    /// A new entry was created for this discovery.
    pub created: bool,
    /// An existing failed entry was reset to pending.
    pub requeued: bool,
}

/// Entry count and payload bytes for one status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: EntryStatus,
    pub count: u64,
    pub bytes: u64,
}

/// Manifest-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub by_status: Vec<StatusCount>,
    pub sources: u64,
}

impl ManifestStats {
    pub fn count(&self, status: EntryStatus) -> u64 {
        self.by_status
            .iter()
            .find(|s| s.status == status)
            .map_or(0, |s| s.count)
    }
}

/// Repository for entries and their provenance.
#[async_trait]
pub trait EntryRepo: Send + Sync {
    /// Register a discovered source reference.
    ///
    /// The identity resolves from an existing provenance row for the
    /// reference, then the advertised hash, then a provisional id. An entry
    /// that already exists is left untouched unless it is `failed` and its
    /// last transition is older than `failure_cooldown`, in which case it is
    /// reset to `pending`. The reference is always recorded as provenance.
    async fn upsert_pending(
        &self,
        source: &SourceRef,
        failure_cooldown: Duration,
    ) -> MetadataResult<Upserted>;

    /// Get an entry by content id.
    async fn get_entry(&self, content_id: &ContentId) -> MetadataResult<Option<ManifestEntry>>;

    /// Get the entry a source reference currently resolves to.
    async fn get_entry_by_source(&self, source_ref: &str)
    -> MetadataResult<Option<ManifestEntry>>;

    /// List every provenance row pointing at an entry.
    async fn list_sources(&self, content_id: &ContentId) -> MetadataResult<Vec<SourceRow>>;

    /// Fetch one keyset page of a scan.
    ///
    /// Returns entries with a status in `statuses`, created at or before the
    /// cursor's snapshot, strictly after the cursor position, ordered by
    /// `(created_at, content_id)`.
    async fn scan_page(
        &self,
        statuses: &[EntryStatus],
        cursor: &ScanCursor,
        limit: u32,
    ) -> MetadataResult<ScanPage>;

    /// Stored entries ordered oldest first, strictly after `after`.
    async fn oldest_stored(
        &self,
        after: Option<(OffsetDateTime, ContentId)>,
        limit: u32,
    ) -> MetadataResult<Vec<ManifestEntry>>;

    /// Number of stored entries and their total size in bytes.
    async fn stored_totals(&self) -> MetadataResult<(u64, u64)>;

    /// Counts and bytes grouped by status.
    async fn stats(&self) -> MetadataResult<ManifestStats>;

    /// Record a successful verification of a stored entry's file.
    async fn touch_verified(
        &self,
        content_id: &ContentId,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Reset failed entries whose last transition is older than `older_than`
    /// back to pending. Returns the number of entries re-queued.
    async fn requeue_failed(&self, older_than: OffsetDateTime) -> MetadataResult<u64>;
}
