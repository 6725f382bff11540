//! Cache entries and freshness evaluation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds in `d`, capped at `u64::MAX`.
pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// What backends store. Opaque to every backend: they persist and return it
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    /// Unix epoch milliseconds after which the entry is no longer fresh.
    pub expiry: u64,
}

impl CacheEntry {
    pub fn new(value: serde_json::Value, expiry: u64) -> Self {
        Self { value, expiry }
    }

    /// Entry expiring `max_age` after `now`.
    pub fn expiring_in(value: serde_json::Value, now: u64, max_age: Duration) -> Self {
        Self::new(value, now.saturating_add(saturating_millis(max_age)))
    }

    pub fn freshness(&self, now: u64, max_staleness: Duration) -> Freshness {
        Freshness::evaluate(self.expiry, now, max_staleness)
    }
}

/// Where an entry sits relative to its expiry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served as is, no refresh.
    Fresh,
    /// Expired but inside the staleness window: served while a background refresh runs.
    Stale,
    /// Past the staleness window: the caller waits for a refresh.
    Expired,
}

impl Freshness {
    /// An entry is expired once `expiry <= now`; the staleness window covers
    /// `now < expiry + max_staleness`. A zero window therefore never yields `Stale`.
    pub fn evaluate(expiry: u64, now: u64, max_staleness: Duration) -> Self {
        if expiry > now {
            Freshness::Fresh
        } else if expiry.saturating_add(saturating_millis(max_staleness)) > now {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}
