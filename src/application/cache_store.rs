// Content-addressable cache of fetch results
use crate::domain::{CacheKey, FetchResult};
use async_compression::tokio::bufread::{BrotliDecoder, BrotliEncoder};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncReadExt;

/// Maps a request's canonical hash to a previously fetched result.
///
/// Implementations must tolerate concurrent readers and writers. Two
/// fetches racing on the same key at worst both reach the provider.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<FetchResult>;
    async fn put(&self, key: CacheKey, result: FetchResult);
    async fn clear(&self);
}

/// Raw byte persistence behind [`BlobCache`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

// ── In-memory LRU ───────────────────────────────────────────────────

struct Entry {
    result: FetchResult,
    last_used: u64,
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<CacheKey, Entry>,
    clock: u64,
}

/// Mutex-guarded map evicting the least recently used entry at capacity.
pub struct MemoryCache {
    inner: Mutex<MemoryInner>,
    capacity: usize,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<FetchResult> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;
        inner.entries.get_mut(key).map(|entry| {
            entry.last_used = now;
            entry.result.clone()
        })
    }

    async fn put(&self, key: CacheKey, result: FetchResult) {
        let mut inner = self.lock();
        inner.clock += 1;
        let last_used = inner.clock;
        inner.entries.insert(key, Entry { result, last_used });

        while inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    tracing::debug!("Evicting cache entry {}", key);
                    inner.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    async fn clear(&self) {
        self.lock().entries.clear();
    }
}

// ── Persisted blobs ─────────────────────────────────────────────────

/// Stores results as Brotli-compressed JSON in a [`BlobStore`].
pub struct BlobCache<B> {
    store: B,
}

impl<B: BlobStore> BlobCache<B> {
    pub fn new(store: B) -> Self {
        Self { store }
    }
}

/// Serialize and compress a result into an opaque blob.
pub async fn encode_blob(result: &FetchResult) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(result)?;
    let mut encoder = BrotliEncoder::new(std::io::Cursor::new(json));
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await?;
    Ok(compressed)
}

pub async fn decode_blob(bytes: Vec<u8>) -> anyhow::Result<FetchResult> {
    let mut decoder = BrotliDecoder::new(std::io::Cursor::new(bytes));
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).await?;
    Ok(serde_json::from_slice(&json)?)
}

#[async_trait]
impl<B: BlobStore> CacheStore for BlobCache<B> {
    async fn get(&self, key: &CacheKey) -> Option<FetchResult> {
        let bytes = match self.store.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Cache blob read failed for {}: {}", key, e);
                return None;
            }
        };
        match decode_blob(bytes).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!("Discarding undecodable cache blob {}: {}", key, e);
                None
            }
        }
    }

    async fn put(&self, key: CacheKey, result: FetchResult) {
        let stored = match encode_blob(&result).await {
            Ok(bytes) => self.store.put(key.as_str(), bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            tracing::warn!("Cache blob write failed for {}: {}", key, e);
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.store.clear().await {
            tracing::warn!("Cache blob clear failed: {}", e);
        }
    }
}
