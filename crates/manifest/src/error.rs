//! Manifest store error types.

use hoard_core::{ContentHash, ContentId, CoreError};
use thiserror::Error;
use time::OffsetDateTime;

/// Why a guarded transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The caller no longer holds the entry's lease.
    LeaseLost,
    /// The payload hash does not match the entry's content identity.
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    /// The entry is not content-addressed yet.
    NotContentAddressed,
    /// The entry moved to a state the transition does not accept.
    StateChanged { status: String },
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeaseLost => f.write_str("lease lost"),
            Self::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {expected}, got {actual}")
            }
            Self::NotContentAddressed => f.write_str("entry is not content-addressed"),
            Self::StateChanged { status } => write!(f, "entry is {status}"),
        }
    }
}

/// Manifest store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Another holder has an unexpired lease on the entry.
    #[error("{content_id} is leased by {holder} until {expires_at}")]
    Busy {
        content_id: ContentId,
        holder: String,
        expires_at: OffsetDateTime,
    },

    #[error("conflict on {content_id}: {reason}")]
    Conflict {
        content_id: ContentId,
        reason: ConflictReason,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MetadataError {
    pub(crate) fn conflict(content_id: ContentId, reason: ConflictReason) -> Self {
        Self::Conflict { content_id, reason }
    }

    /// Lease contention or a lost race. Callers treat these as "someone else
    /// has it" and move on.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. }
                | Self::Conflict {
                    reason: ConflictReason::LeaseLost | ConflictReason::StateChanged { .. },
                    ..
                }
        )
    }
}

/// Result type for manifest operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
