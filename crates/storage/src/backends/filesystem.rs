//! Shared-volume filesystem backend.

use crate::error::{StorageError, StorageResult};
use crate::keys::{self, KeyKind};
use crate::traits::{
    ByteStream, ListedObject, ListingOptions, ListingPage, ObjectMeta, ObjectStore, StagedObject,
    StagedWrite,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use hoard_core::ContentHasher;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Filesystem object store rooted at the shared volume mount.
pub struct FilesystemBackend {
    root: PathBuf,
}

fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// Runs `key_path_sync` on the blocking pool since `canonicalize` and
    /// `symlink_metadata` hit the filesystem.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Resolve a key below the root, rejecting anything that would escape it
    /// lexically or through a symlink.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Existing paths (and broken symlinks) must resolve inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {key}"
                        ))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;

                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }

                // Keep the un-canonicalized path so listings can strip `root`.
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StorageError::Io(std::io::Error::new(
                    err.kind(),
                    format!("failed to stat path: {err}"),
                )));
            }
        }

        // New paths: the nearest existing ancestor must be inside the root,
        // so create_dir_all never follows a symlinked directory out.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;

                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }

        Ok(path)
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Move `from` to `to` and make the new directory entry durable.
    async fn rename_durable(&self, from_key: &str, from: &Path, to: &Path) -> StorageResult<()> {
        self.ensure_parent(to).await?;
        fs::rename(from, to).await.map_err(map_not_found(from_key))?;
        if let Some(parent) = to.parent() {
            sync_dir(parent).await;
        }
        Ok(())
    }
}

/// Best-effort fsync of a directory so a completed rename survives a crash.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        let dir = dir.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || std::fs::File::open(&dir)?.sync_all()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "directory fsync failed"),
            Err(e) => warn!(error = %e, "directory fsync task failed"),
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(map_not_found(key))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(OffsetDateTime::from),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path).await.map_err(map_not_found(key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn stage(&self) -> StorageResult<Box<dyn StagedWrite>> {
        let key = keys::staging_key();
        let path = self.key_path(&key).await?;
        self.ensure_parent(&path).await?;

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        debug!(key = %key, "staged write opened");
        Ok(Box::new(FilesystemStagedWrite {
            file,
            key,
            path,
            hasher: ContentHasher::default(),
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self, staged), fields(backend = "filesystem", staged = %staged.key, hash = %staged.hash))]
    async fn finalize(&self, staged: &StagedObject) -> StorageResult<String> {
        if keys::classify(&staged.key) != KeyKind::Staged {
            return Err(StorageError::InvalidKey(format!(
                "not a staging key: {}",
                staged.key
            )));
        }

        let final_key = keys::object_key(&staged.hash);
        let from = self.key_path(&staged.key).await?;
        let to = self.key_path(&final_key).await?;
        self.rename_durable(&staged.key, &from, &to).await?;

        debug!(key = %final_key, size = staged.size, "object finalized");
        Ok(final_key)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn quarantine(&self, key: &str) -> StorageResult<String> {
        let target = keys::quarantine_key(key);
        let from = self.key_path(key).await?;
        let to = self.key_path(&target).await?;
        self.rename_durable(key, &from, &to).await?;
        Ok(target)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn withdraw(&self, key: &str) -> StorageResult<String> {
        let target = keys::staging_key();
        let from = self.key_path(key).await?;
        let to = self.key_path(&target).await?;
        self.rename_durable(key, &from, &to).await?;
        Ok(target)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(map_not_found(key))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
    ) -> Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            let base_path = self.key_path(&prefix).await?;

            let base_path_exists = match fs::try_exists(&base_path).await {
                Ok(exists) => exists,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => Err(StorageError::Io(e))?,
            };
            if !base_path_exists {
                return;
            }

            let mut stack = vec![base_path];
            let mut current_page = Vec::with_capacity(page_size);

            while let Some(dir) = stack.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    // Directory removed by a concurrent writer.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => Err(StorageError::Io(e))?,
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    // file_type() does not follow symlinks; they are skipped.
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    if !file_type.is_file() {
                        continue;
                    }
                    let Ok(rel) = path.strip_prefix(&root) else {
                        continue;
                    };
                    let metadata = match entry.metadata().await {
                        Ok(metadata) => metadata,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => Err(StorageError::Io(e))?,
                    };
                    current_page.push(ListedObject {
                        key: rel.to_string_lossy().replace('\\', "/"),
                        size: metadata.len(),
                        last_modified: metadata.modified().ok().map(OffsetDateTime::from),
                    });

                    if current_page.len() >= page_size {
                        yield ListingPage {
                            objects: std::mem::replace(
                                &mut current_page,
                                Vec::with_capacity(page_size),
                            ),
                        };
                    }
                }
            }

            if !current_page.is_empty() {
                yield ListingPage { objects: current_page };
            }
        };

        Box::pin(stream)
    }
}

/// Staged write onto the shared volume, hashed as it is written.
struct FilesystemStagedWrite {
    file: fs::File,
    key: String,
    path: PathBuf,
    hasher: ContentHasher,
    bytes_written: u64,
}

#[async_trait]
impl StagedWrite for FilesystemStagedWrite {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.hasher.update(&data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<StagedObject> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let FilesystemStagedWrite {
            file,
            key,
            hasher,
            bytes_written,
            ..
        } = *self;
        drop(file);

        Ok(StagedObject {
            key,
            size: bytes_written,
            hash: hasher.finalize(),
        })
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
