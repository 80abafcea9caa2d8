#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use hoard_archiver::{Archiver, Origin, OriginError, OriginItem, OriginPage, OriginResult, PayloadStream};
use hoard_core::config::ArchiverAppConfig;
use hoard_core::ContentHash;
use hoard_manifest::ManifestStore;
use hoard_storage::{ListedObject, ObjectStore, ObjectStoreListStreamExt};
use std::collections::{HashMap, VecDeque};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Manifest, storage volume and configuration in a temporary root.
pub struct TestEnv {
    pub config: ArchiverAppConfig,
    pub manifest: Arc<dyn ManifestStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config("http://127.0.0.1:9", |_| {}).await
    }

    pub async fn with_config(base_url: &str, adjust: impl FnOnce(&mut ArchiverAppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ArchiverAppConfig::for_testing(temp_dir.path(), base_url);
        adjust(&mut config);

        let manifest = hoard_manifest::from_config(&config.manifest).await.unwrap();
        let storage = hoard_storage::from_config(&config.storage).await.unwrap();
        Self {
            config,
            manifest,
            storage,
            temp_dir,
        }
    }

    pub fn archiver(&self, origin: Arc<dyn Origin>) -> Archiver {
        Archiver::new(
            self.manifest.clone(),
            self.storage.clone(),
            origin,
            &self.config,
        )
    }

    pub async fn files(&self, prefix: &str) -> Vec<ListedObject> {
        self.storage
            .list_objects(prefix, None)
            .try_collect()
            .await
            .unwrap()
    }

    pub async fn read(&self, key: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = self
            .storage
            .get_stream(key)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }
}

/// Scripted fetch reply.
#[derive(Clone)]
pub enum Reply {
    Body(Bytes),
    Transient,
    /// Transient with a server-requested delay.
    RetryAfter(Duration),
    Permanent,
    /// Send one chunk, then never finish.
    Hang,
    /// Send the body in small chunks, pausing before each.
    Trickle(Bytes, Duration),
}

/// In-memory origin with scripted replies and fetch counters.
pub struct StaticOrigin {
    items: Mutex<Vec<OriginItem>>,
    page_size: usize,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    bodies: Mutex<HashMap<String, Reply>>,
    fetches: Mutex<HashMap<String, u32>>,
    list_calls: Mutex<u32>,
}

impl StaticOrigin {
    pub fn new(page_size: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            page_size: page_size.max(1),
            replies: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            list_calls: Mutex::new(0),
        }
    }

    /// One listing page holding `items`.
    pub fn with_items(items: &[(&str, &[u8])]) -> Arc<Self> {
        let origin = Self::new(100);
        for (source_ref, body) in items {
            origin.add(source_ref, body);
        }
        Arc::new(origin)
    }

    pub fn add(&self, source_ref: &str, body: &[u8]) {
        self.items.lock().unwrap().push(OriginItem::new(source_ref));
        self.set_reply(source_ref, Reply::Body(Bytes::copy_from_slice(body)));
    }

    /// Publish an advertised hash for an existing item.
    pub fn advertise(&self, source_ref: &str, hash: ContentHash) {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.iter_mut().find(|i| i.source_ref == source_ref) {
            item.sha256 = Some(hash.to_hex());
        }
    }

    /// Steady-state reply once scripted failures are used up.
    pub fn set_reply(&self, source_ref: &str, reply: Reply) {
        self.bodies
            .lock()
            .unwrap()
            .insert(source_ref.to_string(), reply);
    }

    /// Queue one-off replies served before the steady-state one.
    pub fn script(&self, source_ref: &str, replies: impl IntoIterator<Item = Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(source_ref.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn fetch_count(&self, source_ref: &str) -> u32 {
        self.fetches
            .lock()
            .unwrap()
            .get(source_ref)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u32 {
        self.fetches.lock().unwrap().values().sum()
    }

    pub fn list_calls(&self) -> u32 {
        *self.list_calls.lock().unwrap()
    }

    fn next_reply(&self, source_ref: &str) -> Option<Reply> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(source_ref.to_string())
            .or_default() += 1;

        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(source_ref)
            .and_then(|q| q.pop_front());
        scripted.or_else(|| self.bodies.lock().unwrap().get(source_ref).cloned())
    }
}

#[async_trait]
impl Origin for StaticOrigin {
    async fn list_page(&self, cursor: Option<&str>) -> OriginResult<OriginPage> {
        *self.list_calls.lock().unwrap() += 1;
        let start: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| OriginError::Permanent(format!("bad cursor {c}")))?,
            None => 0,
        };
        let items = self.items.lock().unwrap();
        let end = (start + self.page_size).min(items.len());
        let page: Vec<OriginItem> = items.get(start..end).unwrap_or_default().to_vec();
        Ok(OriginPage {
            items: page,
            next_cursor: (end < items.len()).then(|| end.to_string()),
        })
    }

    async fn fetch(&self, source_ref: &str) -> OriginResult<PayloadStream> {
        match self.next_reply(source_ref) {
            Some(Reply::Body(body)) => {
                // Deliver in small chunks to exercise incremental hashing.
                let chunks: Vec<OriginResult<Bytes>> = body
                    .chunks(7)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(stream::iter(chunks).boxed())
            }
            Some(Reply::Transient) => Err(OriginError::transient("503 Service Unavailable")),
            Some(Reply::RetryAfter(delay)) => Err(OriginError::Transient {
                message: "429 Too Many Requests".to_string(),
                retry_after: Some(delay),
            }),
            Some(Reply::Permanent) | None => {
                Err(OriginError::Permanent("404 Not Found".to_string()))
            }
            Some(Reply::Hang) => Ok(stream::once(async { Ok(Bytes::from_static(b"partial")) })
                .chain(stream::pending())
                .boxed()),
            Some(Reply::Trickle(body, pause)) => {
                let chunks: Vec<Bytes> = body.chunks(7).map(Bytes::copy_from_slice).collect();
                Ok(stream::iter(chunks)
                    .then(move |chunk| async move {
                        tokio::time::sleep(pause).await;
                        Ok::<_, OriginError>(chunk)
                    })
                    .boxed())
            }
        }
    }
}
