//! Benchmarks for cache lookups
//!
//! This benchmark measures:
//! - Fresh hits against the memory store
//! - Fresh hits against the LRU store
//! - skip_cache passthrough (update function only)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use oob_cache::cache::{CacheConfig, GetOptions, MultiLevelCache};
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;

fn warmed(rt: &Runtime, config: CacheConfig, keys: usize) -> MultiLevelCache {
    rt.block_on(async {
        let cache = config.with_max_age(Duration::from_secs(3600)).build().unwrap();
        for i in 0..keys {
            cache
                .get(format!("key-{}", i), &GetOptions::new(), move |_, _| async move {
                    Ok(json!({ "id": i, "payload": "x".repeat(64) }))
                })
                .await
                .unwrap();
        }
        while cache.pending_refreshes() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cache
    })
}

fn bench_fresh_hits(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fresh_hit");

    for (name, config) in [
        ("memory", CacheConfig::new()),
        ("lru", CacheConfig::new().with_max_memory_items(1024)),
    ] {
        let cache = warmed(&rt, config, 256);
        let opts = GetOptions::new();
        group.bench_with_input(BenchmarkId::from_parameter(name), &cache, |b, cache| {
            b.to_async(&rt).iter(|| async {
                let result = cache
                    .get("key-128", &opts, |_, _| async { Ok(json!(null)) })
                    .await
                    .unwrap();
                black_box(result)
            })
        });
    }
    group.finish();
}

fn bench_skip_cache(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = warmed(&rt, CacheConfig::new(), 0);
    let opts = GetOptions::new().skip_cache(true);

    c.bench_function("skip_cache", |b| {
        b.to_async(&rt).iter(|| async {
            let result = cache
                .get("key", &opts, |_, _| async { Ok(json!(1)) })
                .await
                .unwrap();
            black_box(result)
        })
    });
}

criterion_group!(benches, bench_fresh_hits, bench_skip_cache);
criterion_main!(benches);
