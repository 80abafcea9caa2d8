//! Database models mapping to the manifest schema.
//!
//! Timestamps are stored as INTEGER unix milliseconds (UTC) so that range
//! comparisons in SQL are numeric.

use crate::error::{MetadataError, MetadataResult};
use hoard_core::{ContentId, EntryStatus, Lease, ManifestEntry};
use sqlx::FromRow;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

pub(crate) fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

/// `t + by` in milliseconds, saturating at the ends of the supported date
/// range.
pub(crate) fn shifted_millis(t: OffsetDateTime, by: Duration) -> i64 {
    match t.checked_add(by) {
        Some(at) => to_millis(at),
        None if by.is_negative() => to_millis(PrimitiveDateTime::MIN.assume_utc()),
        None => to_millis(PrimitiveDateTime::MAX.assume_utc()),
    }
}

pub(crate) fn from_millis(ms: i64) -> MetadataResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| MetadataError::Internal(format!("timestamp {ms} out of range: {e}")))
}

/// Manifest entry record.
#[derive(Debug, Clone, FromRow)]
pub struct EntryRow {
    pub content_id: String,
    pub source_ref: String,
    pub storage_path: Option<String>,
    pub status: String,
    pub size_bytes: Option<i64>,
    pub attempts: i64,
    pub failure_reason: Option<String>,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_verified_at: Option<i64>,
}

impl TryFrom<EntryRow> for ManifestEntry {
    type Error = MetadataError;

    fn try_from(row: EntryRow) -> MetadataResult<Self> {
        let lease = match (row.lease_holder, row.lease_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease {
                holder,
                expires_at: from_millis(expires_at)?,
            }),
            _ => None,
        };
        Ok(ManifestEntry {
            content_id: row.content_id.parse::<ContentId>()?,
            source_ref: row.source_ref,
            storage_path: row.storage_path,
            status: row.status.parse::<EntryStatus>()?,
            size_bytes: row.size_bytes.map(|s| s as u64),
            attempts: row.attempts as u32,
            failure_reason: row.failure_reason,
            lease,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            last_verified_at: row.last_verified_at.map(from_millis).transpose()?,
        })
    }
}

/// Provenance record: one per discovered source reference.
#[derive(Debug, Clone, FromRow)]
pub struct SourceRow {
    pub source_ref: String,
    pub content_id: String,
    pub advertised_hash: Option<String>,
    pub discovered_at: i64,
}

impl SourceRow {
    pub fn discovered_at(&self) -> MetadataResult<OffsetDateTime> {
        from_millis(self.discovered_at)
    }
}

/// Archiver pass or sweep record.
#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub run_id: Uuid,
    pub kind: String,
    pub state: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub stats_json: Option<String>,
}
