//! Multi-level cache coordinator.
//!
//! Backends are consulted in priority order on read and written in parallel
//! after a refresh. Refreshes are single-flight per key: concurrent lookups of
//! a missing or expired key share one call of the update function.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::entry::{now_millis, CacheEntry, Freshness};
use super::key::CacheKey;
use super::manager::{AtomicStats, CacheStats};
use super::options::{always_cache, Defaults, GetOptions, Resolved, ShouldCache};
use crate::events::{noop_sink, CacheEvent, CacheEventSink, RefreshFailed, WriteFailed};
use crate::{Error, ErrorContext, Result};

/// Default time an entry stays fresh: ten minutes.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

type SharedRefresh = Shared<BoxFuture<'static, Result<serde_json::Value>>>;
type SharedInit = Shared<BoxFuture<'static, Result<()>>>;

/// Outcome of a [`MultiLevelCache::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub value: serde_json::Value,
    /// `true` when served from a backend (fresh or stale), `false` when the
    /// update function produced it for this call.
    pub from_cache: bool,
}

impl GetResult {
    fn cached(value: serde_json::Value) -> Self {
        Self {
            value,
            from_cache: true,
        }
    }
    fn refreshed(value: serde_json::Value) -> Self {
        Self {
            value,
            from_cache: false,
        }
    }

    /// Deserialize the value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

struct PendingRefresh {
    episode: u64,
    task: SharedRefresh,
}

struct Inner {
    backends: Vec<Arc<dyn CacheBackend>>,
    defaults: Defaults,
    pending: Mutex<HashMap<CacheKey, PendingRefresh>>,
    next_episode: AtomicU64,
    init: SharedInit,
    events: Arc<dyn CacheEventSink>,
    stats: AtomicStats,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<CacheKey, PendingRefresh>> {
        // Every critical section is a single map operation, so the map is
        // consistent even if a holder panicked.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears a key's pending-refresh slot when the episode that owns it ends,
/// however it ends.
struct PendingGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    episode: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.pending();
        if pending.get(&self.key).map(|p| p.episode) == Some(self.episode) {
            pending.remove(&self.key);
        }
    }
}

/// A priority-ordered list of backends behind one stale-while-revalidate
/// interface.
///
/// Cheap to clone; clones share backends, defaults and the pending-refresh
/// table. Requires a tokio runtime: refreshes run on spawned tasks so that a
/// caller dropping its future cannot strand the callers that joined it.
#[derive(Clone)]
pub struct MultiLevelCache {
    inner: Arc<Inner>,
}

impl MultiLevelCache {
    pub fn new(
        backends: Vec<Arc<dyn CacheBackend>>,
        max_age: Duration,
        max_staleness: Duration,
        should_cache: Option<ShouldCache>,
    ) -> Result<Self> {
        Self::with_event_sink(backends, max_age, max_staleness, should_cache, noop_sink())
    }

    /// Like [`new`](Self::new), reporting background failures to `events`.
    ///
    /// Backend initialization starts right away when called inside a tokio
    /// runtime, otherwise on the first `get`. Either way it runs once.
    pub fn with_event_sink(
        backends: Vec<Arc<dyn CacheBackend>>,
        max_age: Duration,
        max_staleness: Duration,
        should_cache: Option<ShouldCache>,
        events: Arc<dyn CacheEventSink>,
    ) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::configuration_with_context(
                "at least one cache backend is required",
                ErrorContext::new()
                    .with_field_path("backends")
                    .with_source("multi_level"),
            ));
        }

        let init = init_all(backends.clone()).boxed().shared();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(init.clone());
        }

        Ok(Self {
            inner: Arc::new(Inner {
                backends,
                defaults: Defaults {
                    max_age,
                    max_staleness,
                    should_cache: should_cache.unwrap_or_else(always_cache),
                },
                pending: Mutex::new(HashMap::new()),
                next_episode: AtomicU64::new(0),
                init,
                events,
                stats: AtomicStats::new(),
            }),
        })
    }

    /// Look `key` up, refreshing it through `update_fn` when missing or expired.
    ///
    /// `update_fn` receives the key and the stale value, or `None` on a pure
    /// miss. It runs at most once per refresh episode no matter how many
    /// callers are waiting on that key.
    pub async fn get<K, F, Fut>(&self, key: K, opts: &GetOptions, update_fn: F) -> Result<GetResult>
    where
        K: Into<CacheKey>,
        F: FnOnce(CacheKey, Option<serde_json::Value>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let key = key.into();
        if opts.skip_cache {
            let value = update_fn(key, None).await?;
            return Ok(GetResult::refreshed(value));
        }

        self.inner.init.clone().await?;
        let resolved = self.inner.defaults.resolve(opts);

        let Some(entry) = self.lookup(&key).await else {
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache miss");
            let (task, _) = self.join_or_start(&key, None, update_fn, resolved)?;
            return Ok(GetResult::refreshed(task.await?));
        };

        match entry.freshness(now_millis(), resolved.max_staleness) {
            Freshness::Fresh => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(GetResult::cached(entry.value))
            }
            Freshness::Stale => {
                self.inner.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, expiry = entry.expiry, "serving stale entry, refreshing in background");
                let (task, started) =
                    self.join_or_start(&key, Some(entry.value.clone()), update_fn, resolved)?;
                if started {
                    self.watch_background(key, task);
                }
                Ok(GetResult::cached(entry.value))
            }
            Freshness::Expired => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, expiry = entry.expiry, "entry beyond staleness window");
                let (task, _) =
                    self.join_or_start(&key, Some(entry.value), update_fn, resolved)?;
                Ok(GetResult::refreshed(task.await?))
            }
        }
    }

    /// Clear every backend in parallel.
    ///
    /// All resets run to completion; the first failure is returned. Refreshes
    /// already in flight are not cancelled and may write after the reset.
    pub async fn reset(&self) -> Result<()> {
        let results =
            future::join_all(self.inner.backends.iter().map(|b| b.reset())).await;
        let mut first_err = None;
        for (backend, result) in self.inner.backends.iter().zip(results) {
            if let Err(e) = result {
                warn!(backend = backend.name(), error = %e, "cache reset failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.to_stats()
    }

    /// Number of keys with a refresh in flight.
    pub fn pending_refreshes(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.inner.backends.iter().map(|b| b.name()).collect()
    }

    /// First backend holding the key wins; read errors fall through like misses.
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        for backend in &self.inner.backends {
            match backend.get(key).await {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, backend = backend.name(), error = %e, "cache read failed");
                }
            }
        }
        None
    }

    /// Join the refresh in flight for `key`, or start one. The flag is `true`
    /// when this call started it.
    fn join_or_start<F, Fut>(
        &self,
        key: &CacheKey,
        stale: Option<serde_json::Value>,
        update_fn: F,
        resolved: Resolved,
    ) -> Result<(SharedRefresh, bool)>
    where
        F: FnOnce(CacheKey, Option<serde_json::Value>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "refreshing requires a tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("multi_level"),
            )
        })?;

        let (episode, tx, task) = {
            let mut pending = self.inner.pending();
            if let Some(existing) = pending.get(key) {
                self.inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, episode = existing.episode, "joining refresh in flight");
                return Ok((existing.task.clone(), false));
            }
            let episode = self.inner.next_episode.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            let task = episode_result(rx);
            pending.insert(
                key.clone(),
                PendingRefresh {
                    episode,
                    task: task.clone(),
                },
            );
            (episode, tx, task)
        };

        // Spawned outside the lock: the guard's drop takes it.
        let guard = PendingGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            episode,
        };
        let inner = self.inner.clone();
        let key = key.clone();
        runtime.spawn(async move {
            let result = run_refresh(inner, key, stale, update_fn, resolved, guard).await;
            let _ = tx.send(result);
        });
        Ok((task, true))
    }

    fn watch_background(&self, key: CacheKey, task: SharedRefresh) {
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!(key = %key, error = %e, "background refresh failed, stale entry kept");
                events
                    .report(CacheEvent::RefreshFailed(RefreshFailed::new(
                        key.as_str(),
                        e.to_string(),
                    )))
                    .await;
            }
        });
    }
}

fn episode_result(rx: oneshot::Receiver<Result<serde_json::Value>>) -> SharedRefresh {
    async move {
        rx.await.unwrap_or_else(|_| {
            Err(Error::runtime_with_context(
                "refresh task ended without a result",
                ErrorContext::new().with_source("multi_level"),
            ))
        })
    }
    .boxed()
    .shared()
}

async fn init_all(backends: Vec<Arc<dyn CacheBackend>>) -> Result<()> {
    future::try_join_all(backends.iter().map(|backend| async move {
        backend.init().await.map_err(|e| Error::Initialization {
            backend: backend.name(),
            message: e.to_string(),
        })
    }))
    .await?;
    Ok(())
}

/// One refresh episode. `guard` keeps the key's slot occupied until the
/// episode, including its write-through, is over.
async fn run_refresh<F, Fut>(
    inner: Arc<Inner>,
    key: CacheKey,
    stale: Option<serde_json::Value>,
    update_fn: F,
    resolved: Resolved,
    guard: PendingGuard,
) -> Result<serde_json::Value>
where
    F: FnOnce(CacheKey, Option<serde_json::Value>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    inner.stats.refreshes.fetch_add(1, Ordering::Relaxed);
    let value = match update_fn(key.clone(), stale).await {
        Ok(value) => value,
        Err(e) => {
            inner.stats.refresh_failures.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, error = %e, "refresh failed");
            return Err(e);
        }
    };

    if !(resolved.should_cache)(&value) {
        debug!(key = %key, "refreshed value not cached");
        return Ok(value);
    }

    let entry = CacheEntry::expiring_in(value.clone(), now_millis(), resolved.max_age);
    tokio::spawn(write_through(inner, key, entry, guard));
    Ok(value)
}

async fn write_through(inner: Arc<Inner>, key: CacheKey, entry: CacheEntry, _guard: PendingGuard) {
    let writes = inner.backends.iter().map(|backend| {
        let key = &key;
        let entry = &entry;
        async move { (backend.name(), backend.set(key, entry).await) }
    });
    for (backend, result) in future::join_all(writes).await {
        if let Err(e) = result {
            inner.stats.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, backend, error = %e, "error caching refreshed value");
            inner
                .events
                .report(CacheEvent::WriteFailed(WriteFailed::new(
                    key.as_str(),
                    backend,
                    e.to_string(),
                )))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn memory_cache(max_age: Duration, max_staleness: Duration) -> (MultiLevelCache, Arc<MemoryCache>) {
        let memory = Arc::new(MemoryCache::new());
        let cache = MultiLevelCache::new(vec![memory.clone()], max_age, max_staleness, None).unwrap();
        (cache, memory)
    }

    async fn settle(cache: &MultiLevelCache) {
        for _ in 0..100 {
            if cache.pending_refreshes() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh never settled");
    }

    #[test]
    fn test_empty_backend_list_rejected() {
        let err = MultiLevelCache::new(Vec::new(), DEFAULT_MAX_AGE, Duration::ZERO, None)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (cache, memory) = memory_cache(DEFAULT_MAX_AGE, Duration::ZERO);
        let first = cache
            .get("k", &GetOptions::new(), |key, stale| async move {
                assert_eq!(key.as_str(), "k");
                assert!(stale.is_none());
                Ok(json!("v"))
            })
            .await
            .unwrap();
        assert_eq!(first, GetResult::refreshed(json!("v")));

        settle(&cache).await;
        assert_eq!(memory.len(), 1);

        let second = cache
            .get("k", &GetOptions::new(), |_, _| async { Err::<serde_json::Value, _>(Error::fetch("not called")) })
            .await
            .unwrap();
        assert_eq!(second, GetResult::cached(json!("v")));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_update_fn_receives_stale_value() {
        let (cache, memory) = memory_cache(Duration::ZERO, Duration::ZERO);
        memory
            .set(&"k".into(), &CacheEntry::new(json!({"old": true}), 0))
            .await
            .unwrap();
        let result = cache
            .get("k", &GetOptions::new(), |_, stale| async move {
                assert_eq!(stale, Some(json!({"old": true})));
                Ok(json!({"old": false}))
            })
            .await
            .unwrap();
        assert!(!result.from_cache);
        assert_eq!(result.value, json!({"old": false}));
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_pending_slot() {
        let (cache, _) = memory_cache(DEFAULT_MAX_AGE, Duration::ZERO);
        let err = cache
            .get("k", &GetOptions::new(), |_, _| async { Err::<serde_json::Value, _>(Error::fetch("Aaaa!")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Aaaa!"));
        assert_eq!(cache.pending_refreshes(), 0);

        let retried = cache
            .get("k", &GetOptions::new(), |_, _| async { Ok(json!("Some value")) })
            .await
            .unwrap();
        assert_eq!(retried, GetResult::refreshed(json!("Some value")));
    }

    #[tokio::test]
    async fn test_panicking_update_fn_does_not_wedge_key() {
        let (cache, _) = memory_cache(DEFAULT_MAX_AGE, Duration::ZERO);
        let err = cache
            .get("k", &GetOptions::new(), |_, _| async {
                if true {
                    panic!("update exploded");
                }
                Ok(json!(null))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
        assert_eq!(cache.pending_refreshes(), 0);

        let ok = cache
            .get("k", &GetOptions::new(), |_, _| async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(ok.value, json!(1));
    }

    /// Memory store whose writes take a while to land.
    struct SlowWrites(MemoryCache);

    #[async_trait::async_trait]
    impl CacheBackend for SlowWrites {
        async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.set(key, entry).await
        }
        async fn reset(&self) -> Result<()> {
            self.0.reset().await
        }
        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_slot_held_until_write_through_settles() {
        let store = Arc::new(SlowWrites(MemoryCache::new()));
        let cache = MultiLevelCache::new(vec![store.clone()], DEFAULT_MAX_AGE, Duration::ZERO, None).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let first = cache
            .get("k", &GetOptions::new(), move |_, _| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .await
            .unwrap();
        assert_eq!(first, GetResult::refreshed(json!(1)));
        // The value is back but the write is still in flight.
        assert_eq!(cache.pending_refreshes(), 1);
        assert!(store.0.is_empty());

        // A lookup during the write misses the store and joins the same episode.
        let c = calls.clone();
        let second = cache
            .get("k", &GetOptions::new(), move |_, _| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!(2))
            })
            .await
            .unwrap();
        assert_eq!(second, GetResult::refreshed(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 1);

        settle(&cache).await;
        assert_eq!(store.0.get(&"k".into()).await.unwrap().map(|e| e.value), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_value_as_deserializes() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Lock {
            code: u32,
            planet: String,
        }
        let (cache, _) = memory_cache(DEFAULT_MAX_AGE, Duration::ZERO);
        let result = cache
            .get("lock", &GetOptions::new(), |_, _| async {
                Ok(json!({"code": 12345, "planet": "Druidia"}))
            })
            .await
            .unwrap();
        let lock: Lock = result.value_as().unwrap();
        assert_eq!(
            lock,
            Lock {
                code: 12345,
                planet: "Druidia".into()
            }
        );
    }
}
