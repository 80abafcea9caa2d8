// Staged writes: payloads are invisible under objects/ until finalized,
// and interrupted writes only ever leave files under tmp/.

mod common;

use bytes::Bytes;
use common::{seeded_bytes, stage, store, temp_backend};
use futures::TryStreamExt;
use hoard_core::ContentHash;
use hoard_storage::keys::{OBJECTS_PREFIX, STAGING_PREFIX};
use hoard_storage::{KeyKind, ListedObject, ObjectStore, ObjectStoreListStreamExt, classify};
use std::sync::Arc;

async fn list(backend: &dyn ObjectStore, prefix: &str) -> Vec<ListedObject> {
    backend.list_objects(prefix, None).try_collect().await.unwrap()
}

#[tokio::test]
async fn test_hash_matches_streamed_content() {
    let (_dir, backend) = temp_backend().await;
    let data = seeded_bytes(1, 300_000);

    let staged = stage(&backend, &data, 7919).await;
    assert_eq!(staged.size, data.len() as u64);
    assert_eq!(staged.hash, ContentHash::compute(&data));
}

#[tokio::test]
async fn test_staged_payload_not_visible_until_finalized() {
    let (_dir, backend) = temp_backend().await;
    let data = seeded_bytes(2, 10_000);

    let staged = stage(&backend, &data, 1024).await;
    assert!(list(&backend, OBJECTS_PREFIX).await.is_empty());

    let staged_listing = list(&backend, STAGING_PREFIX).await;
    assert_eq!(staged_listing.len(), 1);
    assert_eq!(staged_listing[0].key, staged.key);
    assert_eq!(classify(&staged.key), KeyKind::Staged);

    let key = backend.finalize(&staged).await.unwrap();
    let objects = list(&backend, OBJECTS_PREFIX).await;
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].key, key);
    assert_eq!(objects[0].size, data.len() as u64);
    assert_eq!(classify(&key), KeyKind::Object(staged.hash));
    assert!(list(&backend, STAGING_PREFIX).await.is_empty());
}

#[tokio::test]
async fn test_dropped_writer_leaves_only_staging_file() {
    let (_dir, backend) = temp_backend().await;

    let mut write = backend.stage().await.unwrap();
    let key = write.key().to_string();
    write.write(Bytes::from_static(b"half a payl")).await.unwrap();
    drop(write);

    assert!(list(&backend, OBJECTS_PREFIX).await.is_empty());
    let leftovers = list(&backend, STAGING_PREFIX).await;
    assert_eq!(leftovers.len(), 1);
    assert_eq!(leftovers[0].key, key);
}

#[tokio::test]
async fn test_concurrent_finalize_of_identical_content() {
    let (_dir, backend) = temp_backend().await;
    let backend = Arc::new(backend);
    let data = seeded_bytes(3, 50_000);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = backend.clone();
        let data = data.clone();
        handles.push(tokio::spawn(async move {
            store(backend.as_ref(), &data).await
        }));
    }

    let mut keys = Vec::new();
    for handle in handles {
        keys.push(handle.await.unwrap());
    }
    keys.dedup();
    assert_eq!(keys.len(), 1);

    let objects = list(backend.as_ref(), OBJECTS_PREFIX).await;
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].size, data.len() as u64);
    assert!(list(backend.as_ref(), STAGING_PREFIX).await.is_empty());

    let chunks: Vec<Bytes> = backend
        .get_stream(&keys[0])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), data.to_vec());
}
