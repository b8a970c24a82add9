// Copyright 2026 stowage Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end behavior of the write-back cache over the in-memory store.

use std::{sync::Arc, thread, time::Duration};

use bytes::Bytes;
use stowage::{Cache, CacheBuilder, CacheConfig, ErrorKind, Event, KvStore, MemoryStore, Spawner};
use stowage_memory::test_utils::{Counter, RecordingListener};
use stowage_store::test_utils::RecordingStore;

type TestStore = RecordingStore<MemoryStore>;

fn store() -> TestStore {
    RecordingStore::new(MemoryStore::new().with_realm("it"))
}

fn stored(store: &TestStore, key: &str) -> Option<Bytes> {
    store.inner().get(key.as_bytes()).unwrap()
}

fn builder() -> CacheBuilder<Counter> {
    CacheBuilder::new()
        .with_name("it")
        .with_batch_timeout(Duration::from_millis(5))
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(std::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[test_log::test(tokio::test)]
async fn test_released_entry_is_persisted_and_evicted_after_flush() {
    let store = store();
    let cache: Cache<Counter, _> = builder().build(store.clone()).unwrap();

    cache.store(Counter::new("k", 1)).release();
    cache.flush().await.unwrap();

    assert_eq!(stored(&store, "k"), Some(Bytes::from_static(b"1")));
    assert!(cache.peek("k").is_none());
    assert!(cache.is_empty());
}

#[test_log::test]
fn test_concurrent_loads_of_missing_key_read_once() {
    let store = store();
    store.set_read_delay(Duration::from_millis(50));
    let cache: Cache<Counter, _> = builder().build(store.clone()).unwrap();

    let loaders = (0..2)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.load("missing").exists().unwrap())
        })
        .collect::<Vec<_>>();
    for loader in loaders {
        assert!(!loader.join().unwrap());
    }
    assert_eq!(store.reads(), 1);
}

#[test_log::test(tokio::test)]
async fn test_eviction_delay_restarts_on_release() {
    let store = store();
    let cache: Cache<Counter, _> = builder()
        .with_cache_time(Duration::from_millis(100))
        .build(store.clone())
        .unwrap();

    cache.store(Counter::new("k", 1)).release();
    let held = cache.load("k");
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(held);

    // The timer armed by the first release would have fired long ago.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.len(), 1);
    assert!(store.history().is_empty());

    wait_until(|| cache.is_empty()).await;
    assert_eq!(stored(&store, "k"), Some(Bytes::from_static(b"1")));
}

#[test_log::test(tokio::test)]
async fn test_failed_batch_is_included_in_next_commit() {
    let store = store();
    let listener = RecordingListener::<Counter>::default();
    let cache: Cache<Counter, _> = builder()
        .with_batch_timeout(Duration::from_secs(60))
        .with_event_listener(Arc::new(listener.clone()))
        .build(store.clone())
        .unwrap();

    store.fail_next_commits(1);
    let entry = cache.store(Counter::new("k", 1));
    let err = cache.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(entry.is_modified());
    assert_eq!(stored(&store, "k"), None);
    assert_eq!(listener.write_errors().len(), 1);

    entry.release();
    cache.flush().await.unwrap();
    assert_eq!(stored(&store, "k"), Some(Bytes::from_static(b"1")));
    assert_eq!(store.commits(), 1);
    assert!(cache.is_empty());
    assert_eq!(listener.leaves()[0].0, Event::Evict);
}

#[test_log::test(tokio::test)]
async fn test_rewrites_are_idempotent() {
    let store = store();
    let cache: Cache<Counter, _> = builder()
        .with_cache_time(Duration::from_secs(60))
        .build(store.clone())
        .unwrap();

    let entry = cache.store(Counter::new("k", 3));
    cache.flush().await.unwrap();
    entry.set(Counter::new("k", 3));
    cache.flush().await.unwrap();
    cache.flush().await.unwrap();

    assert_eq!(store.commits(), 2);
    assert_eq!(stored(&store, "k"), Some(Bytes::from_static(b"3")));
}

#[test_log::test(tokio::test)]
async fn test_realms_are_isolated() {
    let base = MemoryStore::new();
    let left: Cache<Counter, _> = builder().with_name("left").build(base.with_realm("left")).unwrap();
    let right: Cache<Counter, _> = builder().with_name("right").build(base.with_realm("right")).unwrap();

    left.store(Counter::new("k", 1)).release();
    right.store(Counter::new("k", 2)).release();
    left.flush().await.unwrap();
    right.flush().await.unwrap();

    assert_eq!(left.load("k").get().unwrap().map(|c| c.value), Some(1));
    assert_eq!(right.load("k").get().unwrap().map(|c| c.value), Some(2));

    right.prune().await.unwrap();
    assert_eq!(left.load("k").get().unwrap().map(|c| c.value), Some(1));
    assert!(!right.contains("k").unwrap());

    left.close(true).await.unwrap();
    right.close(true).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_caller_runtime_as_spawner() {
    let store = store();
    let cache: Cache<Counter, _> = builder()
        .with_spawner(Spawner::current())
        .with_cache_time(Duration::from_millis(10))
        .build(store.clone())
        .unwrap();

    for i in 0..32 {
        cache.store(Counter::new(format!("k{i}"), i)).release();
    }
    wait_until(|| cache.is_empty()).await;
    assert_eq!(store.inner().total_len(), 32);
    cache.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_build_from_config_document() {
    let config: CacheConfig = serde_json::from_str(
        r#"{
            "name": "from-json",
            "cache_time": { "secs": 0, "nanos": 0 },
            "batch_size": 2,
            "key_partition_sizes": [1]
        }"#,
    )
    .unwrap();
    assert_eq!(config.batch_size, 2);
    assert_eq!(config.queue_capacity, CacheConfig::default().queue_capacity);

    let store = store();
    let cache: Cache<Counter, _> = CacheBuilder::from_config(config).build(store.clone()).unwrap();
    let held = cache.store(Counter::new("ab", 1));
    assert!(cache.is_prefix_retained("a"));
    assert!(!cache.is_prefix_retained("b"));
    drop(held);
    cache.close(true).await.unwrap();
    assert_eq!(stored(&store, "ab"), Some(Bytes::from_static(b"1")));

    let invalid: CacheConfig = serde_json::from_str(r#"{ "shards": 0 }"#).unwrap();
    let err = CacheBuilder::<Counter>::from_config(invalid).build(store).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[cfg(feature = "prometheus")]
#[test_log::test(tokio::test)]
async fn test_prometheus_metrics() {
    use prometheus::{Encoder, Registry, TextEncoder};
    use stowage::PrometheusMetricsRegistry;

    let registry = Registry::new();
    let cache: Cache<Counter, _> = builder()
        .with_metrics_registry(PrometheusMetricsRegistry::new(registry.clone()))
        .build(store())
        .unwrap();

    cache.load("missing").release();
    cache.store(Counter::new("k", 1)).release();
    cache.flush().await.unwrap();

    let mut buf = vec![];
    TextEncoder::new().encode(&registry.gather(), &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    for line in [
        r#"stowage_cache_op_total{name="it",op="load"} 1"#,
        r#"stowage_cache_op_total{name="it",op="miss"} 2"#,
        r#"stowage_cache_op_total{name="it",op="insert"} 1"#,
    ] {
        assert!(text.contains(line), "{line} not found in:\n{text}");
    }
}
