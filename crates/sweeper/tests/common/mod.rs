#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use filetime::FileTime;
use futures::Stream;
use futures::future::BoxFuture;
use hoard_core::config::SweeperAppConfig;
use hoard_core::{ContentHash, ContentId, SourceRef};
use hoard_manifest::ManifestStore;
use hoard_storage::{
    ByteStream, FilesystemBackend, ListingOptions, ListingPage, ObjectMeta, ObjectStore,
    StagedObject, StagedWrite, StorageError, StorageResult,
};
use hoard_sweeper::Sweeper;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Filesystem backend that counts deletes and can be told to fail them.
///
/// A withdrawn file keeps being tracked under the key it was withdrawn from.
pub struct RecordingStore {
    inner: FilesystemBackend,
    failing: Mutex<HashSet<String>>,
    deletes: Mutex<HashMap<String, u32>>,
    before_delete: Mutex<HashMap<String, BoxFuture<'static, ()>>>,
    before_withdraw: Mutex<HashMap<String, BoxFuture<'static, ()>>>,
    withdrawn: Mutex<HashMap<String, String>>,
}

impl RecordingStore {
    pub fn fail_deletes_of(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    /// Run `action` once, right before the first delete of `key`.
    pub fn before_delete_of(&self, key: &str, action: BoxFuture<'static, ()>) {
        self.before_delete
            .lock()
            .unwrap()
            .insert(key.to_string(), action);
    }

    /// Run `action` once, right before `key` is withdrawn.
    pub fn before_withdraw_of(&self, key: &str, action: BoxFuture<'static, ()>) {
        self.before_withdraw
            .lock()
            .unwrap()
            .insert(key.to_string(), action);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Successful deletes of `key`.
    pub fn deletes_of(&self, key: &str) -> u32 {
        self.deletes.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn stage(&self) -> StorageResult<Box<dyn StagedWrite>> {
        self.inner.stage().await
    }

    async fn finalize(&self, staged: &StagedObject) -> StorageResult<String> {
        self.inner.finalize(staged).await
    }

    async fn quarantine(&self, key: &str) -> StorageResult<String> {
        self.inner.quarantine(key).await
    }

    async fn withdraw(&self, key: &str) -> StorageResult<String> {
        let action = self.before_withdraw.lock().unwrap().remove(key);
        if let Some(action) = action {
            action.await;
        }
        let withdrawn = self.inner.withdraw(key).await?;
        self.withdrawn
            .lock()
            .unwrap()
            .insert(withdrawn.clone(), key.to_string());
        Ok(withdrawn)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let original = self.withdrawn.lock().unwrap().get(key).cloned();
        let tracked = original.as_deref().unwrap_or(key);
        let action = self.before_delete.lock().unwrap().remove(tracked);
        if let Some(action) = action {
            action.await;
        }
        if self.failing.lock().unwrap().contains(tracked) {
            return Err(StorageError::Io(std::io::Error::other("injected delete failure")));
        }
        self.inner.delete(key).await?;
        *self
            .deletes
            .lock()
            .unwrap()
            .entry(tracked.to_string())
            .or_default() += 1;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
    ) -> Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>> {
        self.inner.list_pages(prefix, options)
    }
}

/// Manifest, recording storage and configuration in a temporary root.
pub struct TestEnv {
    pub config: SweeperAppConfig,
    pub manifest: Arc<dyn ManifestStore>,
    pub storage: Arc<RecordingStore>,
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut SweeperAppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = SweeperAppConfig::for_testing(temp_dir.path());
        adjust(&mut config);

        let manifest = hoard_manifest::from_config(&config.manifest).await.unwrap();
        let inner = FilesystemBackend::new(temp_dir.path().join("storage"))
            .await
            .unwrap();
        let storage = Arc::new(RecordingStore {
            inner,
            failing: Mutex::new(HashSet::new()),
            deletes: Mutex::new(HashMap::new()),
            before_delete: Mutex::new(HashMap::new()),
            before_withdraw: Mutex::new(HashMap::new()),
            withdrawn: Mutex::new(HashMap::new()),
        });
        Self {
            config,
            manifest,
            storage,
            temp_dir,
        }
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.manifest.clone(), self.storage.clone(), &self.config)
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.temp_dir.path().join("storage").join(key)
    }

    /// Backdate a file's mtime.
    pub fn age(&self, key: &str, by: Duration) {
        let mtime = FileTime::from_system_time(SystemTime::now() - by);
        filetime::set_file_mtime(self.path(key), mtime).unwrap();
    }

    /// Write a staged file and leave it under `tmp/`.
    pub async fn write_staged(&self, data: &[u8]) -> String {
        let mut write = self.storage.stage().await.unwrap();
        write.write(Bytes::copy_from_slice(data)).await.unwrap();
        write.finish().await.unwrap().key
    }

    /// Write a payload at its canonical key without touching the manifest.
    pub async fn write_object(&self, data: &[u8]) -> String {
        let mut write = self.storage.stage().await.unwrap();
        write.write(Bytes::copy_from_slice(data)).await.unwrap();
        let staged = write.finish().await.unwrap();
        self.storage.finalize(&staged).await.unwrap()
    }

    /// Register `data` under `source_ref` and leave it leased and
    /// downloading, without a file.
    pub async fn downloading_entry(
        &self,
        source_ref: &str,
        data: &[u8],
        holder: &str,
        ttl: time::Duration,
    ) -> ContentId {
        let source = SourceRef::new(source_ref).with_advertised(ContentHash::compute(data));
        let upserted = self
            .manifest
            .upsert_pending(&source, time::Duration::hours(1))
            .await
            .unwrap();
        let id = upserted.content_id;
        self.manifest.acquire_lease(&id, holder, ttl).await.unwrap();
        assert!(self.manifest.begin_download(&id, holder).await.unwrap());
        id
    }

    /// A stored entry with its file, exactly as the archiver leaves it.
    pub async fn stored_entry(&self, source_ref: &str, data: &[u8]) -> (ContentId, String) {
        let holder = "seed-archiver";
        let id = self
            .downloading_entry(source_ref, data, holder, time::Duration::minutes(5))
            .await;
        let key = self.write_object(data).await;
        self.manifest
            .commit_stored(
                &id,
                holder,
                &key,
                data.len() as u64,
                ContentHash::compute(data),
            )
            .await
            .unwrap();
        (id, key)
    }
}

/// Let the clock move past timestamps written just before.
pub async fn tick() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
