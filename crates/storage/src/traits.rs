//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hoard_core::ContentHash;
use std::pin::Pin;
use time::OffsetDateTime;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Page size constraints for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 10000;

/// A listed object with the metadata the sweeper needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    /// Last modification time, if the backend reports one.
    pub last_modified: Option<OffsetDateTime>,
}

/// A single page of listing results.
#[derive(Clone, Debug)]
pub struct ListingPage {
    pub objects: Vec<ListedObject>,
}

/// Options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingOptions {
    /// Number of objects per page, clamped to [MIN_PAGE_SIZE, MAX_PAGE_SIZE].
    pub page_size: usize,
}

impl ListingOptions {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    /// Get the normalized page size.
    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<OffsetDateTime>,
}

/// A staged write that has been made durable but is not yet visible under
/// its final key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedObject {
    /// Staging key (under `tmp/`).
    pub key: String,
    pub size: u64,
    /// SHA-256 of everything written.
    pub hash: ContentHash,
}

/// Object store abstraction over the shared volume.
///
/// Payloads only become visible under `objects/` through
/// [`ObjectStore::finalize`], which atomically renames a durable staged file
/// to the canonical key for its hash.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size and mtime without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Start a staged write under a fresh `tmp/` key.
    async fn stage(&self) -> StorageResult<Box<dyn StagedWrite>>;

    /// Atomically move a staged object to the canonical key for its hash.
    ///
    /// Returns the final key. An existing object at that key is replaced;
    /// both hold the same bytes.
    async fn finalize(&self, staged: &StagedObject) -> StorageResult<String>;

    /// Move an object out of the way for operator inspection. Returns the
    /// quarantine key.
    async fn quarantine(&self, key: &str) -> StorageResult<String>;

    /// Atomically move an object out of view to a fresh `tmp/` key and
    /// return that key. [`ObjectStore::finalize`] can put it back.
    async fn withdraw(&self, key: &str) -> StorageResult<String>;

    /// Delete an object. `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Get the name of this storage backend.
    fn backend_name(&self) -> &'static str;

    /// List objects under a prefix as a stream of pages.
    ///
    /// Only one page is materialized at a time.
    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
    ) -> Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>>;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for staged writes.
#[async_trait]
pub trait StagedWrite: Send {
    /// Staging key this write lands at.
    fn key(&self) -> &str;

    /// Append a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Flush and sync the staged file. It stays under its staging key until
    /// finalized.
    async fn finish(self: Box<Self>) -> StorageResult<StagedObject>;

    /// Discard the staged file.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Extension trait flattening `list_pages()` into a stream of objects.
pub trait ObjectStoreListStreamExt: ObjectStore {
    fn list_objects<'a>(
        &'a self,
        prefix: &str,
        options: Option<ListingOptions>,
    ) -> Pin<Box<dyn Stream<Item = StorageResult<ListedObject>> + Send + 'a>> {
        let options = options.unwrap_or_default();
        let page_stream = self.list_pages(prefix, options);

        let object_stream = page_stream.flat_map(|page_result| match page_result {
            Ok(page) => futures::stream::iter(page.objects.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        });

        Box::pin(object_stream)
    }
}

// Blanket implementation for all ObjectStore types
impl<T: ObjectStore + ?Sized> ObjectStoreListStreamExt for T {}
