//! 缓存事件通道：后台刷新与写入失败的带外上报。
//!
//! Out-of-band cache events.
//!
//! Background refreshes and post-fetch storage writes run on detached tasks,
//! so their failures cannot be returned to the `get` caller that triggered
//! them. They are logged with `tracing` and reported to a [`CacheEventSink`].
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheEvent`] | Typed failure event |
//! | [`CacheEventSink`] | Trait for event destinations |
//! | [`NoopEventSink`] | Default sink (drops everything) |
//! | [`InMemoryEventSink`] | Bounded in-memory sink, useful in tests |
//! | [`CompositeEventSink`] | Fans one event out to several sinks |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::cache::now_millis;

/// A background refresh failed; the stale entry it was replacing is untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshFailed {
    pub key: String,
    pub error: String,
    pub timestamp_ms: u64,
}

impl RefreshFailed {
    pub fn new(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: error.into(),
            timestamp_ms: now_millis(),
        }
    }
}

/// A fetched value could not be written to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFailed {
    pub key: String,
    pub backend: String,
    pub error: String,
    pub timestamp_ms: u64,
}

impl WriteFailed {
    pub fn new(key: impl Into<String>, backend: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            backend: backend.into(),
            error: error.into(),
            timestamp_ms: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    RefreshFailed(RefreshFailed),
    WriteFailed(WriteFailed),
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::RefreshFailed(e) => &e.key,
            CacheEvent::WriteFailed(e) => &e.key,
        }
    }
}

/// Destination for out-of-band cache events.
///
/// Reporting is best-effort: implementations must not panic and the cache
/// never waits on a sink from a caller-facing path.
#[async_trait]
pub trait CacheEventSink: Send + Sync {
    async fn report(&self, event: CacheEvent);
}

pub struct NoopEventSink;

#[async_trait]
impl CacheEventSink for NoopEventSink {
    async fn report(&self, _: CacheEvent) {}
}

pub fn noop_sink() -> Arc<dyn CacheEventSink> {
    Arc::new(NoopEventSink)
}

/// In-memory sink keeping the most recent `max_events` events.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<CacheEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max.max(1),
        }
    }
    pub fn events(&self) -> Vec<CacheEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
    pub fn events_for_key(&self, key: &str) -> Vec<CacheEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.key() == key)
            .collect()
    }
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl CacheEventSink for InMemoryEventSink {
    async fn report(&self, event: CacheEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event);
            while events.len() > self.max_events {
                events.pop_front();
            }
        }
    }
}

/// Composite sink for multiple destinations.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn CacheEventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl CacheEventSink for CompositeEventSink {
    async fn report(&self, event: CacheEvent) {
        for s in &self.sinks {
            s.report(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryEventSink::new(2);
        for key in ["a", "b", "c"] {
            sink.report(CacheEvent::RefreshFailed(RefreshFailed::new(key, "boom")))
                .await;
        }
        let keys: Vec<_> = sink.events().iter().map(|e| e.key().to_string()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_composite_fans_out() {
        let a = Arc::new(InMemoryEventSink::default());
        let b = Arc::new(InMemoryEventSink::default());
        let composite = CompositeEventSink::new()
            .add_sink(a.clone())
            .add_sink(b.clone());
        composite
            .report(CacheEvent::WriteFailed(WriteFailed::new("k", "fs", "disk full")))
            .await;
        assert_eq!(a.len(), 1);
        assert_eq!(b.events_for_key("k").len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = CacheEvent::WriteFailed(WriteFailed::new("k", "memory", "nope"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "write_failed");
        assert_eq!(json["backend"], "memory");
    }
}
