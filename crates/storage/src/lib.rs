//! Shared-volume object storage for hoard.
//!
//! This crate provides:
//! - Content-addressed payload keys and the volume layout
//! - Staged writes that become visible only through an atomic rename
//! - Quarantine for payloads that fail verification
//! - Paged listings with size and mtime for the sweeper

pub mod backends;
pub mod error;
pub mod keys;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use keys::{KeyKind, classify, object_key, parse_object_key};
pub use traits::{
    ByteStream, ListedObject, ListingOptions, ListingPage, ObjectMeta, ObjectStore,
    ObjectStoreListStreamExt, StagedObject, StagedWrite,
};

use hoard_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
