//! # oob-cache
//!
//! 带外缓存：在昂贵或不可靠的数据源前提供“过期仍可用、后台再验证”的读穿缓存。
//!
//! Out-of-band, stale-while-revalidate read-through cache.
//!
//! ## Overview
//!
//! Ask the cache for a key together with the function that produces its value.
//! The cache answers from the first backend holding a fresh copy; otherwise it
//! calls the function, at most once per key at any moment, and writes the
//! result to every backend without making the caller wait for the writes.
//!
//! ## Guarantees
//!
//! - **Single-flight**: concurrent lookups of a missing or expired key share one refresh
//! - **Stale survives failure**: a failed refresh never removes a cached value
//! - **Out-of-band writes**: storage failures after a successful fetch are logged and
//!   reported through [`events::CacheEventSink`], never returned to callers
//! - **No wedged keys**: a refresh that fails, panics or is aborted frees its key
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use oob_cache::cache::{CacheConfig, GetOptions};
//!
//! #[tokio::main]
//! async fn main() -> oob_cache::Result<()> {
//!     let cache = CacheConfig::from_env()?.build()?;
//!     let first = cache
//!         .get("greeting", &GetOptions::new(), |_, _| async { Ok(serde_json::json!("hello")) })
//!         .await?;
//!     assert!(!first.from_cache);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Coordinator, backends, configuration |
//! | [`events`] | Out-of-band failure reporting |
//! | [`error`] | Error type |

pub mod cache;
pub mod events;

pub use cache::{
    CacheBackend, CacheConfig, CacheEntry, CacheKey, GetOptions, GetResult, MultiLevelCache,
};
pub use events::{CacheEvent, CacheEventSink};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
