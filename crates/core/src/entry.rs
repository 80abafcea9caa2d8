//! Manifest entry types.

use crate::content::ContentId;
use crate::error::{CoreError, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Lifecycle state of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Downloading,
    Stored,
    Failed,
    Tombstoned,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Pending,
        EntryStatus::Downloading,
        EntryStatus::Stored,
        EntryStatus::Failed,
        EntryStatus::Tombstoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Downloading => "downloading",
            EntryStatus::Stored => "stored",
            EntryStatus::Failed => "failed",
            EntryStatus::Tombstoned => "tombstoned",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "downloading" => Ok(EntryStatus::Downloading),
            "stored" => Ok(EntryStatus::Stored),
            "failed" => Ok(EntryStatus::Failed),
            "tombstoned" => Ok(EntryStatus::Tombstoned),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Advisory, time-bounded claim on an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl Lease {
    /// Whether the lease still blocks other holders at `now`.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }
}

/// A discovered item as reported by the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_ref: String,
    /// SHA-256 the origin claims for the payload, if it publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised: Option<ContentHash>,
}

impl SourceRef {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            advertised: None,
        }
    }

    pub fn with_advertised(mut self, hash: ContentHash) -> Self {
        self.advertised = Some(hash);
        self
    }
}

/// One record per distinct content item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub content_id: ContentId,
    /// First source reference the item was discovered under.
    pub source_ref: String,
    pub storage_path: Option<String>,
    pub status: EntryStatus,
    pub size_bytes: Option<u64>,
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub lease: Option<Lease>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_verified_at: Option<OffsetDateTime>,
}

impl ManifestEntry {
    /// Whether some holder other than `holder` blocks this entry at `now`.
    pub fn is_leased_by_other(&self, holder: &str, now: OffsetDateTime) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.is_active_at(now) && !l.is_held_by(holder))
    }

    pub fn has_active_lease(&self, now: OffsetDateTime) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_active_at(now))
    }
}
