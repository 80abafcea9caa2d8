//! Archiver error types.

use hoard_manifest::{ConflictReason, MetadataError};
use hoard_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Give up on the item now.
    Permanent,
    /// Someone else owns the item; skip it quietly.
    Conflict,
    /// Content hash mismatch; quarantine and fail the item.
    Integrity,
}

/// Errors talking to the origin.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("transient origin error: {message}")]
    Transient {
        message: String,
        /// Server-requested delay before the next attempt.
        retry_after: Option<Duration>,
    },

    #[error("permanent origin error: {0}")]
    Permanent(String),

    #[error("origin configuration error: {0}")]
    Config(String),
}

impl OriginError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classify a transport-level reqwest error.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::transient(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, None, err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }

    /// Map an unsuccessful HTTP status to an error.
    pub(crate) fn from_status(
        status: reqwest::StatusCode,
        retry_after: Option<Duration>,
        message: String,
    ) -> Self {
        let transient = status.is_server_error()
            || matches!(status.as_u16(), 408 | 425 | 429);
        if transient {
            Self::Transient {
                message,
                retry_after,
            }
        } else {
            Self::Permanent(message)
        }
    }
}

/// Result type for origin operations.
pub type OriginResult<T> = std::result::Result<T, OriginError>;

/// Errors raised while archiving an item or running a pass.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("manifest error: {0}")]
    Manifest(#[from] MetadataError),

    #[error("shutdown requested")]
    Cancelled,
}

impl ArchiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Origin(OriginError::Transient { .. }) => ErrorClass::Transient,
            Self::Origin(_) => ErrorClass::Permanent,
            Self::Storage(StorageError::Io(_)) => ErrorClass::Transient,
            Self::Storage(_) => ErrorClass::Permanent,
            Self::Manifest(MetadataError::Conflict {
                reason: ConflictReason::HashMismatch { .. },
                ..
            }) => ErrorClass::Integrity,
            Self::Manifest(e) if e.is_contention() => ErrorClass::Conflict,
            Self::Manifest(MetadataError::NotFound(_)) => ErrorClass::Conflict,
            Self::Manifest(_) => ErrorClass::Permanent,
            Self::Cancelled => ErrorClass::Conflict,
        }
    }

    /// Delay the origin asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Origin(OriginError::Transient { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

/// Result type for archiver operations.
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;
