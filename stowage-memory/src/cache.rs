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

use std::{fmt::Debug, panic::Location, sync::Arc, time::Instant};

use bytes::Bytes;
use hashbrown::HashSet;
use parking_lot::Mutex;
use stowage_common::{
    code::StoredEntity,
    error::{Error, ErrorKind, Result},
    event::EventListener,
    metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, BoxedRegistry, RegistryOps},
    runtime::{SpawnHandle, Spawner},
};
use stowage_store::KvStore;
use tokio::sync::oneshot;

use crate::{
    config::CacheConfig,
    entry::CacheEntry,
    leak::{LeakDetectionConfig, LeakListener, LeakMonitor},
    record::{Flags, Record},
    shared::{Shared, SharedConfig},
    writer::{Submission, Writer, WriterConfig},
};

/// Options of [`Cache::for_each`].
#[derive(Debug, Clone, Default)]
pub struct ForEachOptions {
    /// Only visit keys starting with this prefix.
    pub prefix: Bytes,
    /// Skip keys that are only in the store.
    pub only_cached: bool,
    /// Skip the in-memory pass, visit the store only.
    pub skip_cache: bool,
    /// Stop after this many callbacks.
    pub max_iterations: Option<usize>,
}

impl ForEachOptions {
    /// Visit keys starting with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Visit cached entries only.
    pub fn with_only_cached(mut self, only_cached: bool) -> Self {
        self.only_cached = only_cached;
        self
    }

    /// Visit stored entries only.
    pub fn with_skip_cache(mut self, skip_cache: bool) -> Self {
        self.skip_cache = skip_cache;
        self
    }

    /// Stop after `max_iterations` callbacks.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

/// Publishes a load failure if the creator of a record leaves without publishing, for example by panicking.
struct Publisher<'a, T: StoredEntity> {
    shared: &'a Shared<T>,
    record: &'a Arc<Record<T>>,
}

impl<T: StoredEntity> Drop for Publisher<'_, T> {
    fn drop(&mut self) {
        if self.record.is_published() {
            return;
        }
        let error = Error::new(ErrorKind::External, "entry abandoned before publication")
            .with_context("key", stowage_common::error::hex(self.record.key()));
        if self.record.publish_error(error) {
            self.shared.unlink(self.record);
        }
    }
}

/// Builder of [`Cache`].
pub struct CacheBuilder<T: StoredEntity> {
    config: CacheConfig,
    event_listener: Option<Arc<dyn EventListener<Entity = T>>>,
    leak_listener: Option<Arc<dyn LeakListener>>,
    registry: Option<BoxedRegistry>,
    spawner: Option<Spawner>,
}

impl<T: StoredEntity> Default for CacheBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StoredEntity> CacheBuilder<T> {
    /// Builder with the default configuration.
    pub fn new() -> Self {
        Self::from_config(CacheConfig::default())
    }

    /// Builder with the given configuration.
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            event_listener: None,
            leak_listener: None,
            registry: None,
            spawner: None,
        }
    }

    /// Set the name of the cache, used as metrics label and in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set how long an unreferenced entry stays in memory.
    ///
    /// The default value is zero: entries are evicted as soon as they are unreferenced and committed.
    pub fn with_cache_time(mut self, cache_time: std::time::Duration) -> Self {
        self.config.cache_time = cache_time;
        self
    }

    /// Enable or disable persistence. The default value is `true`.
    pub fn with_persistence_enabled(mut self, persistence_enabled: bool) -> Self {
        self.config.persistence_enabled = persistence_enabled;
        self
    }

    /// Set the maximum entries of a store batch. The default value is 1024.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the maximum time an entry waits in a batch. The default value is 50ms.
    pub fn with_batch_timeout(mut self, batch_timeout: std::time::Duration) -> Self {
        self.config.batch_timeout = batch_timeout;
        self
    }

    /// Set the capacity of the writer queue. The default value is 4096.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    /// Set the number of map shards. The default value is 8.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Persist keys only, with empty values.
    pub fn with_keys_only(mut self, keys_only: bool) -> Self {
        self.config.keys_only = keys_only;
        self
    }

    /// Split keys into partitions of the given segment sizes to track retained prefixes.
    pub fn with_key_partition_sizes(mut self, key_partition_sizes: Vec<usize>) -> Self {
        self.config.key_partition_sizes = key_partition_sizes;
        self
    }

    /// Set handle leak detection.
    pub fn with_leak_detection(mut self, leak_detection: LeakDetectionConfig) -> Self {
        self.config.leak_detection = leak_detection;
        self
    }

    /// Set the listener notified when entries leave the cache and when batched writes fail.
    pub fn with_event_listener(mut self, event_listener: Arc<dyn EventListener<Entity = T>>) -> Self {
        self.event_listener = Some(event_listener);
        self
    }

    /// Set the listener of leak reports.
    pub fn with_leak_listener(mut self, leak_listener: Arc<dyn LeakListener>) -> Self {
        self.leak_listener = Some(leak_listener);
        self
    }

    /// Set the metrics registry. Metrics are discarded by default.
    pub fn with_metrics_registry(mut self, registry: impl RegistryOps) -> Self {
        self.registry = Some(Box::new(registry));
        self
    }

    /// Set the spawner of the writer and the eviction timers.
    ///
    /// By default the cache runs them on a dedicated runtime with two worker threads.
    pub fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Build the cache on top of `store`.
    pub fn build<S: KvStore>(self, store: S) -> Result<Cache<T, S>> {
        self.config.validate()?;
        let config = self.config;

        let metrics = Arc::new(match self.registry.as_ref() {
            Some(registry) => Metrics::new(config.name.clone(), registry.as_ref()),
            None => Metrics::new(config.name.clone(), &NoopMetricsRegistry),
        });
        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => Spawner::dedicated(&config.name, 2)?,
        };

        let leak = Arc::new(LeakMonitor::new(
            config.leak_detection.clone(),
            self.leak_listener,
            metrics.clone(),
        ));
        leak.spawn_scanner(&spawner);

        let (tx, rx) = flume::bounded(config.queue_capacity);
        let shared = Arc::new(Shared::new(SharedConfig {
            name: config.name.clone(),
            shards: config.shards,
            tx,
            spawner: spawner.clone(),
            cache_time: config.cache_time,
            persistence_enabled: config.persistence_enabled,
            partition_sizes: config.key_partition_sizes.clone(),
            leak,
            metrics: metrics.clone(),
            listener: self.event_listener.clone(),
        }));

        let writer = Writer::new(
            rx,
            Arc::downgrade(&shared),
            store.clone(),
            WriterConfig {
                batch_size: config.batch_size,
                batch_timeout: config.batch_timeout,
                keys_only: config.keys_only,
                persistence_enabled: config.persistence_enabled,
            },
            metrics,
            self.event_listener,
        );
        let writer = spawner.spawn(writer.run());

        tracing::info!("[cache]: cache {} built with {config:?}", config.name);

        Ok(Cache {
            inner: Arc::new(CacheInner {
                shared,
                store,
                writer: Mutex::new(Some(writer)),
            }),
        })
    }
}

struct CacheInner<T: StoredEntity, S: KvStore> {
    shared: Arc<Shared<T>>,
    store: S,
    writer: Mutex<Option<SpawnHandle<()>>>,
}

impl<T: StoredEntity, S: KvStore> Drop for CacheInner<T, S> {
    fn drop(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        let pending = self.shared.pending_writes();
        if pending > 0 {
            tracing::warn!(
                "[cache]: cache {} dropped without close, {pending} entries with uncommitted changes may be lost",
                self.shared.name
            );
        }
        // Best effort: hand dirty entries to the writer, which keeps running while handles are alive.
        let mut lost = 0;
        for record in self.shared.collect_dirty() {
            if let Err(e) = self.shared.tx.try_send(Submission::Entry(record)) {
                if let Submission::Entry(record) = e.into_inner() {
                    record.clear_queued();
                }
                lost += 1;
            }
        }
        if lost > 0 {
            tracing::warn!(
                "[cache]: cache {} dropped without close, {lost} dirty entries were not handed to the writer",
                self.shared.name
            );
        }
    }
}

/// A write-back object cache in front of a [`KvStore`].
///
/// Loads of one key are deduplicated, entries stay in memory while they have consumers, and dirty entries are
/// persisted in batches by a background writer once they become idle.
///
/// The cache is cheap to clone. Only `close(true)` makes pending changes durable: dropping the last clone without it
/// hands dirty entries to the writer on a best-effort basis, and commits still running when the background runtime
/// shuts down are lost.
pub struct Cache<T: StoredEntity, S: KvStore> {
    inner: Arc<CacheInner<T, S>>,
}

impl<T: StoredEntity, S: KvStore> Clone for Cache<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: StoredEntity, S: KvStore> Debug for Cache<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.shared.name)
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<T: StoredEntity, S: KvStore> Cache<T, S> {
    /// Builder of a cache.
    pub fn builder() -> CacheBuilder<T> {
        CacheBuilder::new()
    }

    fn shared(&self) -> &Arc<Shared<T>> {
        &self.inner.shared
    }

    fn handle(&self, record: Arc<Record<T>>, location: &'static Location<'static>) -> CacheEntry<T> {
        CacheEntry::new(self.shared().clone(), record, location)
    }

    /// Find or create the entry of `key`, reading the store on creation.
    ///
    /// Returns at once. Concurrent loads of one key share a single store read; the handle blocks on first access
    /// until that read is published. A missing key is published as an entry without value, a read error is
    /// published to every waiter.
    #[track_caller]
    pub fn load(&self, key: impl Into<Bytes>) -> CacheEntry<T> {
        self.load_at(key.into(), Location::caller())
    }

    fn load_at(&self, key: Bytes, location: &'static Location<'static>) -> CacheEntry<T> {
        let (record, created) = self.shared().find_or_create(&key);
        let entry = self.handle(record, location);
        if created {
            self.fill(entry.record());
        }
        entry
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "stowage::memory::cache::fill"))]
    fn fill(&self, record: &Arc<Record<T>>) {
        let shared = self.shared();
        let publisher = Publisher { shared, record };
        if !shared.persistence_enabled {
            record.publish(None, Flags::PERSIST);
            return;
        }

        let start = Instant::now();
        let result = self.inner.store.get(record.key()).and_then(|value| match value {
            Some(value) => T::from_key_value(record.key(), &value)
                .map(|entity| Some(Arc::new(entity)))
                .map_err(|e| Error::decode(record.key(), e)),
            None => Ok(None),
        });
        shared.metrics.cache_load.increase(1);
        shared.metrics.cache_load_duration.record(start.elapsed().as_secs_f64());

        match result {
            Ok(value) => {
                record.publish(value, Flags::PERSIST);
            }
            Err(e) => {
                tracing::warn!(
                    "[cache]: failed to load {} in cache {}: {e}",
                    stowage_common::error::hex(record.key()),
                    shared.name
                );
                if record.publish_error(e) {
                    shared.unlink(record);
                }
            }
        }
        drop(publisher);
    }

    /// Find or create the entry of `key` without touching the store.
    ///
    /// A created entry is published without value. It is memory only until a value is stored with [`Cache::store`] or
    /// persistence is enabled with [`CacheEntry::persist`].
    #[track_caller]
    pub fn get(&self, key: impl Into<Bytes>) -> CacheEntry<T> {
        let key = key.into();
        let (record, created) = self.shared().find_or_create(&key);
        if created {
            record.publish(None, Flags::empty());
        }
        self.handle(record, Location::caller())
    }

    /// Return the cached entry of `key`, if any. Never creates an entry.
    #[track_caller]
    pub fn peek(&self, key: impl AsRef<[u8]>) -> Option<CacheEntry<T>> {
        let location = Location::caller();
        self.shared()
            .lookup(key.as_ref())
            .map(|record| self.handle(record, location))
    }

    /// Cache `entity` and mark it to be persisted. Never blocks on the store.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[track_caller]
    pub fn store(&self, entity: T) -> CacheEntry<T> {
        self.insert(entity, Some(true), Location::caller())
    }

    /// Cache `entity`, keeping the persistence choice of the existing entry. New entries are memory only.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[track_caller]
    pub fn put(&self, entity: T) -> CacheEntry<T> {
        self.insert(entity, None, Location::caller())
    }

    fn insert(&self, entity: T, persist: Option<bool>, location: &'static Location<'static>) -> CacheEntry<T> {
        self.shared().assert_open();
        let key = entity.storage_key();
        let (record, created) = self.shared().find_or_create(&key);
        let entry = self.handle(record, location);
        let publisher = created.then(|| Publisher {
            shared: self.shared(),
            record: entry.record(),
        });
        entry.write(Arc::new(entity), persist);
        drop(publisher);
        entry
    }

    /// Store `entity` only if its key has no value, in memory or in the store.
    ///
    /// Returns `None` without a handle if a value exists.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[track_caller]
    pub fn store_if_absent(&self, entity: T) -> Result<Option<CacheEntry<T>>> {
        self.shared().assert_open();
        let entry = self.load_at(entity.storage_key(), Location::caller());
        entry.wait()?;
        let guard = entry.record().lock_update();
        if entry.value().is_some() {
            return Ok(None);
        }
        entry.write_locked(Arc::new(entity), Some(true));
        drop(guard);
        Ok(Some(entry))
    }

    /// Return the entry of `key`, computing its value with `f` if it has none.
    ///
    /// The store is not read: `f` runs on absence from memory and may read the store itself. `f` runs at most once at
    /// a time per entry, and a computed value is persisted like [`Cache::store`]. If `f` returns `None` the entry
    /// stays without value. `f` must not modify `key` through the cache.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[track_caller]
    pub fn compute_if_absent<F>(&self, key: impl Into<Bytes>, f: F) -> Result<CacheEntry<T>>
    where
        F: FnOnce(&Bytes) -> Option<T>,
    {
        self.shared().assert_open();
        let key = key.into();
        let (record, created) = self.shared().find_or_create(&key);
        let entry = self.handle(record, Location::caller());

        if created {
            let publisher = Publisher {
                shared: self.shared(),
                record: entry.record(),
            };
            let guard = entry.record().lock_update();
            match f(&key) {
                Some(entity) => entry.write_locked(Arc::new(entity), Some(true)),
                None => {
                    entry.record().publish(None, Flags::empty());
                }
            }
            drop(guard);
            drop(publisher);
            return Ok(entry);
        }

        entry.wait()?;
        let guard = entry.record().lock_update();
        if entry.value().is_none() {
            if let Some(entity) = f(&key) {
                entry.write_locked(Arc::new(entity), Some(true));
            }
        }
        drop(guard);
        Ok(entry)
    }

    /// Delete `key` if it has a value, in memory or in the store. Returns whether it had one.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[track_caller]
    pub fn delete_if_present(&self, key: impl Into<Bytes>) -> Result<bool> {
        self.shared().assert_open();
        let entry = self.load_at(key.into(), Location::caller());
        entry.wait()?;
        let _guard = entry.record().lock_update();
        if entry.value().is_none() {
            return Ok(false);
        }
        entry.delete_locked();
        Ok(true)
    }

    /// Delete `key` without reading it first.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[track_caller]
    pub fn delete(&self, key: impl Into<Bytes>) {
        self.shared().assert_open();
        let key = key.into();
        let (record, created) = self.shared().find_or_create(&key);
        if created {
            record.publish(None, Flags::PERSIST);
        }
        let entry = self.handle(record, Location::caller());
        entry.delete();
    }

    /// Whether `key` has a value, checking memory first and the store after.
    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        if let Some(entry) = self.peek(key) {
            return entry.exists();
        }
        if !self.shared().persistence_enabled {
            return Ok(false);
        }
        self.inner.store.has(key)
    }

    /// Call `f` with a handle of every entry that has a value, cached entries first, then stored keys not seen in
    /// memory. A cached entry without value hides its stored key.
    ///
    /// Iteration stops when `f` returns `false`. Handles are released when `f` drops them.
    #[track_caller]
    pub fn for_each<F>(&self, options: ForEachOptions, mut f: F) -> Result<()>
    where
        F: FnMut(CacheEntry<T>) -> bool,
    {
        let location = Location::caller();
        let max = options.max_iterations.unwrap_or(usize::MAX);
        let mut visited = 0;
        let mut seen = HashSet::new();

        if !options.skip_cache {
            let entries = self
                .shared()
                .snapshot(&options.prefix)
                .into_iter()
                .map(|record| self.handle(record, location))
                .collect::<Vec<_>>();
            for entry in entries {
                if visited >= max {
                    return Ok(());
                }
                // Deleted or empty entries shadow their stored keys until the delete is committed.
                seen.insert(entry.key().clone());
                if !entry.exists()? {
                    continue;
                }
                visited += 1;
                if !f(entry) {
                    return Ok(());
                }
            }
        }

        if options.only_cached || !self.shared().persistence_enabled || visited >= max {
            return Ok(());
        }

        let mut keys = vec![];
        self.inner.store.iterate_keys(&options.prefix, &mut |key| {
            if !seen.contains(key) {
                keys.push(Bytes::copy_from_slice(key));
            }
            true
        })?;

        for key in keys {
            if visited >= max {
                break;
            }
            let entry = self.load_at(key, location);
            if !entry.exists()? {
                continue;
            }
            visited += 1;
            if !f(entry) {
                break;
            }
        }
        Ok(())
    }

    /// Drop the whole realm from memory and from the store.
    ///
    /// Entries still held by handles are detached: later changes through those handles are not persisted.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "stowage::memory::cache::prune"))]
    pub async fn prune(&self) -> Result<()> {
        self.shared().assert_open();
        let records = self.shared().drain();
        tracing::info!(
            "[cache]: prune cache {}, dropped {} entries",
            self.shared().name,
            records.len()
        );
        // Let the writer finish whatever it holds, detached records are skipped.
        self.barrier().await?;
        if !self.shared().persistence_enabled {
            return Ok(());
        }
        let store = self.inner.store.clone();
        self.shared().spawner.spawn_blocking(move || store.clear()).await?
    }

    /// Hand every dirty entry to the writer and wait for the commit.
    ///
    /// Returns the commit error if the batch failed. The entries stay dirty and are retried.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "stowage::memory::cache::flush"))]
    pub async fn flush(&self) -> Result<()> {
        if self.shared().is_closed() {
            return Err(Error::closed("cache is closed"));
        }
        self.enqueue_dirty().await?;
        self.barrier().await
    }

    async fn enqueue_dirty(&self) -> Result<()> {
        for record in self.shared().collect_dirty() {
            self.shared().metrics.writer_enqueue.increase(1);
            if let Err(e) = self.shared().tx.send_async(Submission::Entry(record)).await {
                if let Submission::Entry(record) = e.into_inner() {
                    record.clear_queued();
                }
                return Err(Error::new(ErrorKind::ChannelClosed, "writer is gone"));
            }
        }
        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared()
            .tx
            .send_async(Submission::Wait { tx })
            .await
            .map_err(|_| Error::new(ErrorKind::ChannelClosed, "writer is gone"))?;
        rx.await
            .map_err(|e| Error::new(ErrorKind::ChannelClosed, "writer is gone").with_source(e))?
    }

    /// Number of cached entries with changes not committed yet, including entries the writer is committing.
    pub fn pending_writes(&self) -> usize {
        self.shared().pending_writes()
    }

    /// Stop the writer and wait for it to exit.
    ///
    /// With `drain`, every dirty entry is committed first. Any later mutation through the cache or its handles
    /// panics. Closing twice is a no-op.
    pub async fn close(&self, drain: bool) -> Result<()> {
        if !self.shared().close() {
            return Ok(());
        }
        tracing::info!("[cache]: close cache {}, drain: {drain}", self.shared().name);
        if drain {
            self.enqueue_dirty().await?;
        }
        self.shared()
            .tx
            .send_async(Submission::Close { drain })
            .await
            .map_err(|_| Error::new(ErrorKind::ChannelClosed, "writer is gone"))?;
        let writer = self.inner.writer.lock().take();
        if let Some(writer) = writer {
            writer.await?;
        }
        Ok(())
    }

    /// Whether an entry with a key under `prefix` is in memory.
    pub fn is_prefix_retained(&self, prefix: impl AsRef<[u8]>) -> bool {
        self.shared().is_prefix_retained(prefix.as_ref())
    }

    /// Remove every stored key under `prefix`, unless an entry under `prefix` is in memory.
    ///
    /// Returns whether anything was removed.
    pub fn delete_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<bool> {
        let prefix = prefix.as_ref();
        if self.is_prefix_retained(prefix) {
            return Ok(false);
        }
        self.inner.store.delete_prefix(prefix)
    }

    /// Number of entries in memory.
    pub fn len(&self) -> usize {
        self.shared().len()
    }

    /// Whether no entry is in memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metrics of the cache.
    pub fn metrics(&self) -> &Metrics {
        &self.shared().metrics
    }

    /// Realm of the underlying store.
    pub fn realm(&self) -> &Bytes {
        self.inner.store.realm()
    }

    /// The underlying store.
    pub fn backend(&self) -> &S {
        &self.inner.store
    }

    /// Number of live handles tracked by leak detection.
    pub fn tracked_handles(&self) -> usize {
        self.shared().leak.outstanding()
    }
}
