//! Manifest test utilities.

use hoard_core::{ContentHash, ContentId, SourceRef};
use hoard_manifest::{ManifestStore, MetadataResult, SqliteStore};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A test manifest store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestManifest {
    pub store: Arc<dyn ManifestStore>,
    sqlite_store: Arc<SqliteStore>,
    path: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestManifest {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let path = temp_dir.path().join("manifest.db");
        let store = Arc::new(SqliteStore::new(&path, Duration::from_secs(5)).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            path,
            _temp_dir: temp_dir,
        })
    }

    /// Open a second, independent store on the same database file, as a
    /// separate process would.
    pub async fn reopen(&self) -> MetadataResult<Arc<dyn ManifestStore>> {
        let store = SqliteStore::new(&self.path, Duration::from_secs(5)).await?;
        Ok(Arc::new(store))
    }

    /// Open a store whose read-only sessions use the same file.
    pub async fn reopen_with_reader(&self) -> MetadataResult<SqliteStore> {
        SqliteStore::open(&self.path, Some(&self.path), Duration::from_secs(5)).await
    }

    pub fn store(&self) -> Arc<dyn ManifestStore> {
        self.store.clone()
    }

    /// Raw pool for fixture setup.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }

    /// Shift an entry's timestamps into the past.
    pub async fn backdate(&self, content_id: &ContentId, by: time::Duration) {
        let ms = by.whole_milliseconds() as i64;
        sqlx::query(
            "UPDATE entries SET created_at = created_at - ?, updated_at = updated_at - ? \
             WHERE content_id = ?",
        )
        .bind(ms)
        .bind(ms)
        .bind(content_id.to_string())
        .execute(self.pool())
        .await
        .expect("backdate entry");
    }
}

/// A source carrying the hash of `payload` as its advertised hash.
#[allow(dead_code)]
pub fn advertised_source(source_ref: &str, payload: &[u8]) -> SourceRef {
    SourceRef::new(source_ref).with_advertised(ContentHash::compute(payload))
}
