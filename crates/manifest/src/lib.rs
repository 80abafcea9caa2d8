//! Manifest store for hoard.
//!
//! The manifest is the single source of truth shared by the archiver and the
//! sweeper:
//! - Entries keyed by content identity, with their lifecycle status
//! - Provenance rows mapping source references to entries
//! - Per-entry advisory leases guarding every transition
//! - Run history for archiver passes and sweeps

pub mod error;
pub mod models;
pub mod repos;
pub mod scan;
pub mod store;

pub use error::{ConflictReason, MetadataError, MetadataResult};
pub use repos::{
    EntryRepo, LeaseRepo, ManifestStats, Resolution, RunKind, RunRepo, RunState, StatusCount,
    Upserted,
};
pub use scan::{ManifestScanExt, ScanCursor, ScanPage, ScanPosition};
pub use store::{ManifestStore, SqliteStore};

use hoard_core::config::ManifestConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create a manifest store from configuration.
pub async fn from_config(config: &ManifestConfig) -> MetadataResult<Arc<dyn ManifestStore>> {
    match config {
        ManifestConfig::Sqlite {
            path,
            busy_timeout_secs,
            readonly_path,
        } => {
            let store = SqliteStore::open(
                path,
                readonly_path.as_deref(),
                Duration::from_secs(*busy_timeout_secs),
            )
            .await?;
            Ok(Arc::new(store) as Arc<dyn ManifestStore>)
        }
    }
}
