//! 多级缓存模块：过期后仍可返回旧值并在后台刷新，同一键的刷新只执行一次。
//!
//! # Multi-Level Cache Module
//!
//! A read-through cache for expensive or unreliable data sources. Values are
//! served from the first backend that holds them; expired values are either
//! served stale while a background refresh runs or refreshed in the
//! foreground, depending on the staleness window.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MultiLevelCache`] | Coordinator: lookup chain, freshness policy, single-flight refreshes |
//! | [`CacheConfig`] | Builds the default backend stack and the coordinator |
//! | [`CacheBackend`] | Trait for storage backends |
//! | [`MemoryCache`] | Unbounded in-memory store |
//! | [`LruMemoryCache`] | Item-bounded in-memory store with LRU eviction |
//! | [`FileSystemCache`] | One JSON file per key, named by SHA-256 of the key |
//! | [`GetOptions`] | Per-call overrides |
//!
//! ## Freshness
//!
//! | State | Condition | Behavior |
//! |-------|-----------|----------|
//! | Fresh | `now < expiry` | served, `from_cache = true` |
//! | Stale | `expiry <= now < expiry + max_staleness` | served, refresh in background |
//! | Expired | `now >= expiry + max_staleness` | caller waits for refresh, `from_cache = false` |
//!
//! ## Example
//!
//! ```rust,no_run
//! use oob_cache::cache::{CacheConfig, GetOptions};
//! use std::time::Duration;
//!
//! # async fn run() -> oob_cache::Result<()> {
//! let cache = CacheConfig::new()
//!     .with_max_age(Duration::from_secs(600))
//!     .with_max_staleness(Duration::from_secs(3600))
//!     .with_fs_cache_path(".cache")
//!     .build()?;
//!
//! let result = cache
//!     .get("lock-code", &GetOptions::new(), |_key, _stale| async {
//!         Ok(serde_json::json!({ "code": 12345 }))
//!     })
//!     .await?;
//! println!("{} (cached: {})", result.value, result.from_cache);
//! # Ok(())
//! # }
//! ```

mod backend;
mod entry;
mod key;
mod manager;
mod multi_level;
mod options;

pub use backend::{CacheBackend, FileSystemCache, LruMemoryCache, MemoryCache};
pub use entry::{now_millis, CacheEntry, Freshness};
pub use key::CacheKey;
pub use manager::{CacheConfig, CacheStats};
pub use multi_level::{GetResult, MultiLevelCache, DEFAULT_MAX_AGE};
pub use options::{always_cache, GetOptions, ShouldCache};
