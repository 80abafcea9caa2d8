//! Lease-guarded state transitions.
//!
//! Every mutation of an entry's lifecycle goes through one of these
//! operations. Each is a single conditional UPDATE or a short transaction
//! whose first statement is the guarding write.

use crate::error::MetadataResult;
use async_trait::async_trait;
use hoard_core::{ContentHash, ContentId, EntryStatus, Lease};
use time::Duration;

/// Outcome of binding a fetched payload to its content identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The caller's entry carries the content id (it already did, or it was
    /// re-keyed from its provisional id).
    Claimed(ContentId),
    /// An entry for the content already existed. Provenance moved into it,
    /// the provisional entry was dropped and the caller now holds the
    /// target's lease.
    Merged {
        into: ContentId,
        already_stored: bool,
    },
}

impl Resolution {
    pub fn content_id(&self) -> ContentId {
        match self {
            Resolution::Claimed(id) => *id,
            Resolution::Merged { into, .. } => *into,
        }
    }
}

/// Repository for leases and the transitions they guard.
#[async_trait]
pub trait LeaseRepo: Send + Sync {
    /// Grant or refresh a lease.
    ///
    /// Fails with `Busy` when a different holder has an unexpired lease.
    /// Idempotent for the same holder. Expired leases may be taken by anyone.
    async fn acquire_lease(
        &self,
        content_id: &ContentId,
        holder: &str,
        ttl: Duration,
    ) -> MetadataResult<Lease>;

    /// `acquire_lease`, granted only while the entry is in `status`.
    ///
    /// Fails with `Conflict` (`StateChanged`) when the entry moved on.
    async fn acquire_lease_if(
        &self,
        content_id: &ContentId,
        holder: &str,
        ttl: Duration,
        status: EntryStatus,
    ) -> MetadataResult<Lease>;

    /// Clear the lease if `holder` still owns it.
    async fn release_lease(&self, content_id: &ContentId, holder: &str) -> MetadataResult<bool>;

    /// Move a `pending` or `downloading` entry to `downloading` and bump its
    /// attempt counter. Returns `false` if the entry is in any other state.
    async fn begin_download(&self, content_id: &ContentId, holder: &str) -> MetadataResult<bool>;

    /// Bind the caller's entry to the content-addressed identity of `hash`.
    ///
    /// A tombstoned target is never revived: the merge is refused with
    /// `Conflict` until the sweeper has removed the row.
    async fn resolve_content(
        &self,
        content_id: &ContentId,
        holder: &str,
        ttl: Duration,
        hash: ContentHash,
    ) -> MetadataResult<Resolution>;

    /// Transition to `stored`, set `last_verified_at` and clear the lease.
    ///
    /// `Conflict` if `hash` does not match the content id or the caller no
    /// longer holds the lease.
    async fn commit_stored(
        &self,
        content_id: &ContentId,
        holder: &str,
        storage_path: &str,
        size_bytes: u64,
        hash: ContentHash,
    ) -> MetadataResult<()>;

    /// Transition to `failed`, record the reason and release the lease.
    async fn mark_failed(
        &self,
        content_id: &ContentId,
        holder: &str,
        reason: &str,
    ) -> MetadataResult<()>;

    /// Give an entry back: `downloading` returns to `pending` and the lease
    /// is cleared.
    async fn abandon(&self, content_id: &ContentId, holder: &str) -> MetadataResult<bool>;

    /// Mark an entry approved for physical deletion and clear its storage
    /// path.
    ///
    /// Refused with `Busy` when an unexpired lease is held and with
    /// `Conflict` while the entry is `downloading`.
    async fn tombstone(&self, content_id: &ContentId) -> MetadataResult<()>;

    /// Delete the row of a tombstoned entry leased by `holder`.
    async fn remove_tombstoned(&self, content_id: &ContentId, holder: &str)
    -> MetadataResult<bool>;
}
