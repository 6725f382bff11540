//! Cache backend implementations.

use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Storage capability consumed by [`MultiLevelCache`](super::MultiLevelCache).
///
/// `get` reports absence as `Ok(None)`; an `Err` is a real failure (unreadable
/// file, corrupt payload). Entries are opaque: store and return them verbatim.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Idempotent setup. Failure is fatal to the owning cache.
    async fn init(&self) -> Result<()> {
        Ok(())
    }
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;
    async fn reset(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

fn poisoned(backend: &'static str) -> Error {
    Error::backend(backend, "lock poisoned")
}

/// Unbounded in-memory map.
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-populate the store.
    pub fn with_items(items: impl IntoIterator<Item = (CacheKey, CacheEntry)>) -> Self {
        Self {
            entries: RwLock::new(items.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned(self.name()))?;
        Ok(entries.get(key).cloned())
    }
    async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| poisoned(self.name()))?
            .insert(key.clone(), entry.clone());
        Ok(())
    }
    async fn reset(&self) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| poisoned(self.name()))?
            .clear();
        Ok(())
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

struct LruSlot {
    entry: CacheEntry,
    inserted_at: Instant,
}

/// In-memory map bounded by item count, evicting the least recently used.
///
/// With `max_age` set, entries older than that read as absent regardless of
/// their own expiry.
pub struct LruMemoryCache {
    items: Mutex<LruCache<CacheKey, LruSlot>>,
    max_age: Option<Duration>,
}

impl LruMemoryCache {
    pub fn new(max_items: usize, max_age: Option<Duration>) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_items).ok_or_else(|| {
            Error::configuration_with_context(
                "LRU capacity must be a positive integer",
                ErrorContext::new()
                    .with_field_path("max_memory_items")
                    .with_details(format!("got {}", max_items))
                    .with_source("lru_memory_cache"),
            )
        })?;
        Ok(Self {
            items: Mutex::new(LruCache::new(capacity)),
            max_age,
        })
    }

    pub fn with_items(
        max_items: usize,
        max_age: Option<Duration>,
        items: impl IntoIterator<Item = (CacheKey, CacheEntry)>,
    ) -> Result<Self> {
        let cache = Self::new(max_items, max_age)?;
        {
            let mut lru = cache.items.lock().map_err(|_| poisoned("lru"))?;
            let now = Instant::now();
            for (key, entry) in items {
                lru.put(key, LruSlot { entry, inserted_at: now });
            }
        }
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for LruMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut items = self.items.lock().map_err(|_| poisoned(self.name()))?;
        let too_old = match items.get(key) {
            None => return Ok(None),
            Some(slot) => self
                .max_age
                .map(|age| slot.inserted_at.elapsed() > age)
                .unwrap_or(false),
        };
        if too_old {
            items.pop(key);
            return Ok(None);
        }
        Ok(items.peek(key).map(|slot| slot.entry.clone()))
    }
    async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        self.items.lock().map_err(|_| poisoned(self.name()))?.put(
            key.clone(),
            LruSlot {
                entry: entry.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }
    async fn reset(&self) -> Result<()> {
        self.items.lock().map_err(|_| poisoned(self.name()))?.clear();
        Ok(())
    }
    fn name(&self) -> &'static str {
        "lru"
    }
}

/// Temp file suffix counter, shared by every instance in the process.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// One JSON file per key inside `dir`, named by the key's SHA-256 digest.
///
/// Several instances, in one process or many, may share a directory.
pub struct FileSystemCache {
    dir: PathBuf,
}

impl FileSystemCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.digest())
    }
}

#[async_trait]
impl CacheBackend for FileSystemCache {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let data = match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let data = serde_json::to_vec(entry)?;
        let target = self.path_for(key);
        // Write then rename so readers never observe a partial file. The temp
        // name must be unique per writer, across instances and processes.
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!("{}.{}.{}.tmp", key.digest(), std::process::id(), seq));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(child) = dir.next_entry().await? {
            let path = child.path();
            let removed = if child.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => {}
                // A concurrent rename or reset got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
