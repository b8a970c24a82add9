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

use std::{
    hash::BuildHasher,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use stowage_common::{
    code::StoredEntity,
    error::hex,
    event::{Event, EventListener},
    metrics::model::Metrics,
    runtime::Spawner,
    scope::Scope,
    strict_assert,
};

use crate::{
    leak::LeakMonitor,
    partition::{split_key, RetainTree},
    record::{Flags, Record},
    writer::Submission,
};

type Shard<T> = RwLock<HashMap<Bytes, Arc<Record<T>>>>;

/// State shared by the cache, its handles, its timers and its writer.
///
/// The map is split into shards, each behind its own lock. A shard lock is only held to look up and retain, to
/// insert, or to remove. Everything else works on the record atomics.
pub(crate) struct Shared<T: StoredEntity> {
    pub name: String,
    shards: Box<[Shard<T>]>,
    hasher: RandomState,

    pub tx: flume::Sender<Submission<T>>,
    pub spawner: Spawner,
    pub cache_time: Duration,
    pub persistence_enabled: bool,

    partition_sizes: Vec<usize>,
    partitions: Option<RetainTree>,

    pub leak: Arc<LeakMonitor>,
    pub metrics: Arc<Metrics>,
    pub listener: Option<Arc<dyn EventListener<Entity = T>>>,

    closed: AtomicBool,
}

pub(crate) struct SharedConfig<T: StoredEntity> {
    pub name: String,
    pub shards: usize,
    pub tx: flume::Sender<Submission<T>>,
    pub spawner: Spawner,
    pub cache_time: Duration,
    pub persistence_enabled: bool,
    pub partition_sizes: Vec<usize>,
    pub leak: Arc<LeakMonitor>,
    pub metrics: Arc<Metrics>,
    pub listener: Option<Arc<dyn EventListener<Entity = T>>>,
}

impl<T: StoredEntity> Shared<T> {
    pub fn new(config: SharedConfig<T>) -> Self {
        let partitions = (!config.partition_sizes.is_empty()).then(RetainTree::new);
        Self {
            name: config.name,
            shards: (0..config.shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            tx: config.tx,
            spawner: config.spawner,
            cache_time: config.cache_time,
            persistence_enabled: config.persistence_enabled,
            partition_sizes: config.partition_sizes,
            partitions,
            leak: config.leak,
            metrics: config.metrics,
            listener: config.listener,
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard<T> {
        &self.shards[self.hasher.hash_one(key) as usize % self.shards.len()]
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the cache closed. Returns `false` if it was closed already.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// # Panics
    ///
    /// Panics if the cache is closed.
    pub fn assert_open(&self) {
        assert!(!self.is_closed(), "cache {} is closed", self.name);
    }

    /// Look up and retain a cached record.
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<Record<T>>> {
        self.shard(key).read().with(|map| {
            map.get(key).map(|record| {
                record.retain();
                record.clone()
            })
        })
    }

    /// Find the record of `key` or insert a fresh unpublished one. The returned record is retained.
    ///
    /// Returns `true` along with a newly created record. Its creator is responsible for publishing it.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "stowage::memory::shared::find_or_create"))]
    pub fn find_or_create(&self, key: &Bytes) -> (Arc<Record<T>>, bool) {
        if let Some(record) = self.lookup(key) {
            self.metrics.cache_hit.increase(1);
            return (record, false);
        }

        let shard = self.shard(key);
        let mut map = shard.write();
        // Another thread may have inserted the record between the two locks.
        if let Some(record) = map.get(key) {
            record.retain();
            self.metrics.cache_hit.increase(1);
            return (record.clone(), false);
        }
        let record = Arc::new(Record::new(key.clone()));
        map.insert(key.clone(), record.clone());
        if let Some(tree) = self.partitions.as_ref() {
            tree.retain(&split_key(key, &self.partition_sizes));
        }
        drop(map);

        self.metrics.cache_miss.increase(1);
        self.metrics.cache_entries.increase(1);
        (record, true)
    }

    /// Remove an idle, clean record from the map.
    pub fn try_remove(&self, record: &Arc<Record<T>>) -> bool {
        let removed = self.shard(record.key()).write().with(|mut map| {
            let state = record.retain_state();
            if state.consumers() > 0
                || state.is_queued()
                || state.is_evicted()
                || record.flags().contains(Flags::MODIFIED)
            {
                return false;
            }
            match map.get(record.key()) {
                Some(r) if Arc::ptr_eq(r, record) => {}
                _ => return false,
            }
            map.remove(record.key());
            record.mark_evicted();
            true
        });
        if removed {
            let event = match record.flags().contains(Flags::DELETE) {
                true => Event::Remove,
                false => Event::Evict,
            };
            self.on_removed(record, event);
        }
        removed
    }

    /// Remove a record regardless of its state, used when its load failed.
    pub fn unlink(&self, record: &Arc<Record<T>>) {
        let removed = self.shard(record.key()).write().with(|mut map| match map.get(record.key()) {
            Some(r) if Arc::ptr_eq(r, record) => {
                map.remove(record.key());
                record.mark_evicted();
                true
            }
            _ => false,
        });
        if removed {
            self.release_partition(record);
            self.metrics.cache_entries.decrease(1);
        }
    }

    /// Remove every record from the map.
    pub fn drain(&self) -> Vec<Arc<Record<T>>> {
        let mut records = vec![];
        for shard in self.shards.iter() {
            let drained = shard.write().with(|mut map| map.drain().map(|(_, r)| r).collect::<Vec<_>>());
            for record in drained.iter() {
                record.mark_evicted();
            }
            records.extend(drained);
        }
        for record in records.iter() {
            self.on_removed(record, Event::Clear);
        }
        records
    }

    fn on_removed(&self, record: &Arc<Record<T>>, event: Event) {
        strict_assert!(record.is_evicted());
        match event {
            Event::Evict => self.metrics.cache_evict.increase(1),
            Event::Remove => self.metrics.cache_remove.increase(1),
            Event::Clear => self.metrics.cache_clear.increase(1),
        }
        self.metrics.cache_entries.decrease(1);
        self.release_partition(record);
        tracing::trace!(
            "[cache]: {} left cache {} with {event:?}",
            hex(record.key()),
            self.name
        );
        if let Some(listener) = self.listener.as_ref() {
            listener.on_leave(event, record.key(), record.value().as_deref());
        }
    }

    fn release_partition(&self, record: &Record<T>) {
        if let Some(tree) = self.partitions.as_ref() {
            tree.release(&split_key(record.key(), &self.partition_sizes));
        }
    }

    /// Retain every cached record whose key starts with `prefix`, in key order.
    pub fn snapshot(&self, prefix: &[u8]) -> Vec<Arc<Record<T>>> {
        let mut records = vec![];
        for shard in self.shards.iter() {
            shard.read().with(|map| {
                for (key, record) in map.iter() {
                    if key.starts_with(prefix) {
                        record.retain();
                        records.push(record.clone());
                    }
                }
            });
        }
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    /// Mark every dirty record queued and return them.
    pub fn collect_dirty(&self) -> Vec<Arc<Record<T>>> {
        let mut records = vec![];
        for shard in self.shards.iter() {
            shard.read().with(|map| {
                for record in map.values() {
                    if record.flags().contains(Flags::MODIFIED) && record.try_mark_queued() {
                        records.push(record.clone());
                    }
                }
            });
        }
        records
    }

    /// Number of cached records with changes not committed yet, including those in the writer's hands.
    pub fn pending_writes(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|record| record.flags().contains(Flags::MODIFIED) || record.retain_state().is_queued())
                    .count()
            })
            .sum()
    }

    /// Whether a cached record lives under `prefix`.
    pub fn is_prefix_retained(&self, prefix: &[u8]) -> bool {
        if let Some(tree) = self.partitions.as_ref() {
            let mut boundary = 0;
            let aligned = prefix.is_empty()
                || self.partition_sizes.iter().any(|size| {
                    boundary += size;
                    boundary == prefix.len()
                });
            if aligned {
                let prefix = Bytes::copy_from_slice(prefix);
                return tree.is_retained(&split_key(&prefix, &self.partition_sizes));
            }
        }
        self.shards
            .iter()
            .any(|shard| shard.read().keys().any(|key| key.starts_with(prefix)))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }
}

impl<T: StoredEntity> Drop for Shared<T> {
    fn drop(&mut self) {
        tracing::debug!("[cache]: cache {} dropped with {} entries", self.name, self.len());
    }
}
