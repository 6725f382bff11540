//! Per-call options and their resolution against cache-wide defaults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a freshly fetched value is written to the backends.
pub type ShouldCache = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

pub fn always_cache() -> ShouldCache {
    Arc::new(|_| true)
}

/// Options for a single [`MultiLevelCache::get`](super::MultiLevelCache::get).
///
/// Every field left unset falls back to the cache-wide default of the same
/// name, independently of the others.
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Call the update function directly; no backend is read or written.
    pub skip_cache: bool,
    pub max_age: Option<Duration>,
    pub max_staleness: Option<Duration>,
    pub should_cache: Option<ShouldCache>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }
    pub fn with_should_cache<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.should_cache = Some(Arc::new(predicate));
        self
    }
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("skip_cache", &self.skip_cache)
            .field("max_age", &self.max_age)
            .field("max_staleness", &self.max_staleness)
            .field("should_cache", &self.should_cache.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Cache-wide defaults.
#[derive(Clone)]
pub(crate) struct Defaults {
    pub max_age: Duration,
    pub max_staleness: Duration,
    pub should_cache: ShouldCache,
}

/// Settings in effect for one call.
#[derive(Clone)]
pub(crate) struct Resolved {
    pub max_age: Duration,
    pub max_staleness: Duration,
    pub should_cache: ShouldCache,
}

impl Defaults {
    pub fn resolve(&self, opts: &GetOptions) -> Resolved {
        Resolved {
            max_age: opts.max_age.unwrap_or(self.max_age),
            max_staleness: opts.max_staleness.unwrap_or(self.max_staleness),
            should_cache: opts
                .should_cache
                .clone()
                .unwrap_or_else(|| self.should_cache.clone()),
        }
    }
}
