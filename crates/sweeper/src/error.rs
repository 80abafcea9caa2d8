//! Sweeper error types.

use hoard_manifest::MetadataError;
use hoard_storage::StorageError;
use thiserror::Error;

/// Errors that end a sweep early.
///
/// Per-item failures are counted in the sweep stats instead.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("manifest error: {0}")]
    Manifest(#[from] MetadataError),
}

/// Result type for sweep operations.
pub type SweepResult<T> = std::result::Result<T, SweepError>;
