//! Instrumented backends shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use oob_cache::cache::{CacheBackend, CacheEntry, CacheKey, MemoryCache};
use oob_cache::{Error, MultiLevelCache, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wraps a [`MemoryCache`], counting calls and optionally failing some of them.
#[derive(Default)]
pub struct InstrumentedBackend {
    pub store: MemoryCache,
    pub inits: AtomicUsize,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
    pub resets: AtomicUsize,
    pub fail_init: bool,
    pub fail_get: bool,
    pub fail_set: bool,
    pub fail_reset: bool,
    pub name: &'static str,
}

impl InstrumentedBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }
    pub fn failing_get(mut self) -> Self {
        self.fail_get = true;
        self
    }
    pub fn failing_set(mut self) -> Self {
        self.fail_set = true;
        self
    }
    pub fn failing_reset(mut self) -> Self {
        self.fail_reset = true;
        self
    }
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheBackend for InstrumentedBackend {
    async fn init(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to pile up on the init task.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail_init {
            return Err(Error::backend(self.name, "mkdir refused"));
        }
        Ok(())
    }
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get {
            return Err(Error::backend(self.name, "read refused"));
        }
        self.store.get(key).await
    }
    async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_set {
            return Err(Error::backend(self.name, "disk full"));
        }
        self.store.set(key, entry).await
    }
    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset {
            return Err(Error::backend(self.name, "reset refused"));
        }
        self.store.reset().await
    }
    fn name(&self) -> &'static str {
        self.name
    }
}

/// Wait until no refresh (including its write-through) is in flight.
pub async fn settle(cache: &MultiLevelCache) {
    for _ in 0..200 {
        if cache.pending_refreshes() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("refreshes never settled");
}

pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}
