//! Cache configuration, backend composition and statistics.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::backend::{CacheBackend, FileSystemCache, LruMemoryCache, MemoryCache};
use super::entry::saturating_millis;
use super::multi_level::{MultiLevelCache, DEFAULT_MAX_AGE};
use super::options::ShouldCache;
use crate::events::{noop_sink, CacheEventSink};
use crate::{Error, ErrorContext, Result};

/// Builds a [`MultiLevelCache`] over the default backend stack: memory first
/// (plain or LRU-bounded), then an optional file store, then any extra
/// backends in the order they were added.
#[derive(Clone)]
pub struct CacheConfig {
    pub max_age: Duration,
    pub max_staleness: Duration,
    pub should_cache: Option<ShouldCache>,
    pub fs_cache_path: Option<PathBuf>,
    /// Swaps the unbounded memory store for an LRU of this many items.
    pub max_memory_items: Option<usize>,
    /// Age after which LRU entries read as absent. Ignored without `max_memory_items`.
    pub memory_max_age: Option<Duration>,
    pub extra_backends: Vec<Arc<dyn CacheBackend>>,
    pub event_sink: Arc<dyn CacheEventSink>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            max_staleness: Duration::ZERO,
            should_cache: None,
            fs_cache_path: None,
            max_memory_items: None,
            memory_max_age: None,
            extra_backends: Vec::new(),
            event_sink: noop_sink(),
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("max_age", &self.max_age)
            .field("max_staleness", &self.max_staleness)
            .field("should_cache", &self.should_cache.as_ref().map(|_| "<fn>"))
            .field("fs_cache_path", &self.fs_cache_path)
            .field("max_memory_items", &self.max_memory_items)
            .field("memory_max_age", &self.memory_max_age)
            .field(
                "extra_backends",
                &self.extra_backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    env_parse::<u64>(name).map(|ms| ms.map(Duration::from_millis))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid value {:?}", raw),
                ErrorContext::new()
                    .with_field_path(name)
                    .with_details(e.to_string())
                    .with_source("cache_config"),
            )
        }),
        Err(_) => Ok(None),
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the environment:
    /// - `OOB_CACHE_MAX_AGE_MS`
    /// - `OOB_CACHE_MAX_STALENESS_MS`
    /// - `OOB_CACHE_FS_PATH` (empty disables the file store)
    /// - `OOB_CACHE_MAX_MEMORY_ITEMS`
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(max_age) = env_millis("OOB_CACHE_MAX_AGE_MS")? {
            cfg.max_age = max_age;
        }
        if let Some(max_staleness) = env_millis("OOB_CACHE_MAX_STALENESS_MS")? {
            cfg.max_staleness = max_staleness;
        }
        cfg.fs_cache_path = std::env::var("OOB_CACHE_FS_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        cfg.max_memory_items = env_parse::<usize>("OOB_CACHE_MAX_MEMORY_ITEMS")?;
        Ok(cfg)
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }
    pub fn with_should_cache<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.should_cache = Some(Arc::new(predicate));
        self
    }
    pub fn with_fs_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fs_cache_path = Some(path.into());
        self
    }
    pub fn with_max_memory_items(mut self, max_items: usize) -> Self {
        self.max_memory_items = Some(max_items);
        self
    }
    pub fn with_memory_max_age(mut self, max_age: Duration) -> Self {
        self.memory_max_age = Some(max_age);
        self
    }
    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.extra_backends.push(backend);
        self
    }
    pub fn with_event_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The backend list, in lookup order.
    pub fn backends(&self) -> Result<Vec<Arc<dyn CacheBackend>>> {
        let mut backends: Vec<Arc<dyn CacheBackend>> = Vec::new();
        match self.max_memory_items {
            Some(max_items) => backends.push(Arc::new(LruMemoryCache::new(
                max_items,
                self.memory_max_age,
            )?)),
            None => backends.push(Arc::new(MemoryCache::new())),
        }
        if let Some(ref path) = self.fs_cache_path {
            backends.push(Arc::new(FileSystemCache::new(path)));
        }
        backends.extend(self.extra_backends.iter().cloned());
        Ok(backends)
    }

    pub fn build(&self) -> Result<MultiLevelCache> {
        let backends = self.backends()?;
        tracing::debug!(
            backends = ?backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            max_age_ms = saturating_millis(self.max_age),
            max_staleness_ms = saturating_millis(self.max_staleness),
            "building multi-level cache"
        );
        MultiLevelCache::with_event_sink(
            backends,
            self.max_age,
            self.max_staleness,
            self.should_cache.clone(),
            self.event_sink.clone(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fresh entries served.
    pub hits: u64,
    /// Expired entries served inside the staleness window.
    pub stale_hits: u64,
    /// Lookups that had to wait for a refresh.
    pub misses: u64,
    /// Update function invocations.
    pub refreshes: u64,
    /// Lookups that joined a refresh already in flight.
    pub coalesced: u64,
    pub refresh_failures: u64,
    pub write_failures: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

pub(crate) struct AtomicStats {
    pub hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub refreshes: AtomicU64,
    pub coalesced: AtomicU64,
    pub refresh_failures: AtomicU64,
    pub write_failures: AtomicU64,
}

impl AtomicStats {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }
    pub fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
