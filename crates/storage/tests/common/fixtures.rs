use bytes::Bytes;
use hoard_storage::{FilesystemBackend, ObjectStore, StagedObject};
use tempfile::TempDir;

/// Deterministic pseudo-random payload for a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    Bytes::from(data)
}

/// A filesystem backend over a fresh temporary volume.
pub async fn temp_backend() -> (TempDir, FilesystemBackend) {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    (temp_dir, backend)
}

/// Stage `data` in chunks and return the durable staged object.
pub async fn stage(backend: &dyn ObjectStore, data: &Bytes, chunk_size: usize) -> StagedObject {
    let mut write = backend.stage().await.unwrap();
    for chunk in data.chunks(chunk_size.max(1)) {
        write.write(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    write.finish().await.unwrap()
}

/// Stage and finalize `data`, returning its object key.
#[allow(dead_code)]
pub async fn store(backend: &dyn ObjectStore, data: &Bytes) -> String {
    let staged = stage(backend, data, 4096).await;
    backend.finalize(&staged).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 1000), seeded_bytes(42, 1000));
        assert_ne!(seeded_bytes(42, 1000), seeded_bytes(43, 1000));
        assert_eq!(seeded_bytes(7, 13).len(), 13);
    }
}
