//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid content id: {0}")]
    InvalidContentId(String),

    #[error("invalid entry status: {0}")]
    InvalidStatus(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
