//! Restartable keyset scans over manifest entries.

use crate::error::MetadataResult;
use crate::repos::EntryRepo;
use futures::Stream;
use hoard_core::{ContentId, EntryStatus, ManifestEntry};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use time::OffsetDateTime;

/// Position inside a scan.
///
/// The snapshot time is fixed when the scan starts: entries created after
/// it are never yielded, however many pages later they would sort. A cursor
/// can be serialized and handed to a later process to resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    #[serde(with = "time::serde::rfc3339")]
    pub snapshot_at: OffsetDateTime,
    pub after: Option<ScanPosition>,
}

/// Sort key of the last entry yielded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPosition {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub content_id: ContentId,
}

impl ScanCursor {
    /// Start a scan at `snapshot_at`.
    pub fn new(snapshot_at: OffsetDateTime) -> Self {
        Self {
            snapshot_at,
            after: None,
        }
    }

    /// Start a scan at the current time.
    pub fn now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    /// Cursor positioned just past `entry`, keeping the snapshot.
    pub fn advance(&self, entry: &ManifestEntry) -> Self {
        Self {
            snapshot_at: self.snapshot_at,
            after: Some(ScanPosition {
                created_at: entry.created_at,
                content_id: entry.content_id,
            }),
        }
    }
}

/// One page of a scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub entries: Vec<ManifestEntry>,
    /// Cursor for the next page. None once the scan is exhausted.
    pub next: Option<ScanCursor>,
}

/// Lazy scans built on [`EntryRepo::scan_page`].
pub trait ManifestScanExt: EntryRepo {
    /// Scan entries with a status in `statuses` from a fresh snapshot.
    fn scan<'a>(
        &'a self,
        statuses: &'a [EntryStatus],
        page_size: u32,
    ) -> Pin<Box<dyn Stream<Item = MetadataResult<ManifestEntry>> + Send + 'a>> {
        self.scan_from(statuses, ScanCursor::now(), page_size)
    }

    /// Resume a scan from `cursor`.
    ///
    /// Only one page is held in memory at a time.
    fn scan_from<'a>(
        &'a self,
        statuses: &'a [EntryStatus],
        cursor: ScanCursor,
        page_size: u32,
    ) -> Pin<Box<dyn Stream<Item = MetadataResult<ManifestEntry>> + Send + 'a>> {
        Box::pin(async_stream::try_stream! {
            let mut cursor = cursor;
            loop {
                let page = self.scan_page(statuses, &cursor, page_size).await?;
                for entry in page.entries {
                    yield entry;
                }
                match page.next {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
        })
    }
}

impl<T: EntryRepo + ?Sized> ManifestScanExt for T {}
