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

use std::borrow::Cow;

use super::{registry::noop::NoopMetricsRegistry, BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

// FIXME: https://github.com/rust-lang/rust-analyzer/issues/17685
// #[expect(missing_docs)]
/// Metrics of a write-back cache instance, all labeled by the cache name.
#[derive(Debug)]
pub struct Metrics {
    /* cache metrics */
    /// Lookups served from memory.
    pub cache_hit: BoxedCounter,
    /// Lookups that created a new entry.
    pub cache_miss: BoxedCounter,
    /// Store reads performed on behalf of `load`.
    pub cache_load: BoxedCounter,
    /// In-memory value writes (`store`, `put`, `set`, `update`).
    pub cache_insert: BoxedCounter,
    /// Entries removed from memory after a clean, idle commit.
    pub cache_evict: BoxedCounter,
    /// Entries removed from memory after a committed delete.
    pub cache_remove: BoxedCounter,
    /// Entries discarded by prune.
    pub cache_clear: BoxedCounter,

    /// Entries currently held in memory.
    pub cache_entries: BoxedGauge,

    /// Duration of store reads.
    pub cache_load_duration: BoxedHistogram,

    /* writer metrics */
    /// Records handed to the writer.
    pub writer_enqueue: BoxedCounter,
    /// Committed batches.
    pub writer_commit: BoxedCounter,
    /// Failed batch commits.
    pub writer_error: BoxedCounter,
    /// Sets written to the store.
    pub writer_set: BoxedCounter,
    /// Deletes written to the store.
    pub writer_delete: BoxedCounter,

    /// Records per committed batch.
    pub writer_batch_size: BoxedHistogram,
    /// Duration of batch commits.
    pub writer_commit_duration: BoxedHistogram,

    /* leak detection metrics */
    /// Handles held longer than allowed.
    pub leak_held_too_long: BoxedCounter,
    /// Retains beyond the allowed consumer count.
    pub leak_too_many_consumers: BoxedCounter,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new<R>(name: impl Into<Cow<'static, str>>, registry: &R) -> Self
    where
        R: RegistryOps + ?Sized,
    {
        let name: Cow<'static, str> = name.into();

        let stowage_cache_op_total =
            registry.register_counter_vec("stowage_cache_op_total", "stowage cache operations", &["name", "op"]);
        let stowage_cache_entries =
            registry.register_gauge_vec("stowage_cache_entries", "stowage cache in-memory entries", &["name"]);
        let stowage_cache_op_duration = registry.register_histogram_vec(
            "stowage_cache_op_duration",
            "stowage cache op durations",
            &["name", "op"],
        );

        let cache_hit = stowage_cache_op_total.counter(&[name.clone(), "hit".into()]);
        let cache_miss = stowage_cache_op_total.counter(&[name.clone(), "miss".into()]);
        let cache_load = stowage_cache_op_total.counter(&[name.clone(), "load".into()]);
        let cache_insert = stowage_cache_op_total.counter(&[name.clone(), "insert".into()]);
        let cache_evict = stowage_cache_op_total.counter(&[name.clone(), "evict".into()]);
        let cache_remove = stowage_cache_op_total.counter(&[name.clone(), "remove".into()]);
        let cache_clear = stowage_cache_op_total.counter(&[name.clone(), "clear".into()]);

        let cache_entries = stowage_cache_entries.gauge(&[name.clone()]);

        let cache_load_duration = stowage_cache_op_duration.histogram(&[name.clone(), "load".into()]);

        let stowage_writer_op_total =
            registry.register_counter_vec("stowage_writer_op_total", "stowage writer operations", &["name", "op"]);
        let stowage_writer_batch_size =
            registry.register_histogram_vec("stowage_writer_batch_size", "stowage writer batch sizes", &["name"]);
        let stowage_writer_op_duration = registry.register_histogram_vec(
            "stowage_writer_op_duration",
            "stowage writer op durations",
            &["name", "op"],
        );

        let writer_enqueue = stowage_writer_op_total.counter(&[name.clone(), "enqueue".into()]);
        let writer_commit = stowage_writer_op_total.counter(&[name.clone(), "commit".into()]);
        let writer_error = stowage_writer_op_total.counter(&[name.clone(), "error".into()]);
        let writer_set = stowage_writer_op_total.counter(&[name.clone(), "set".into()]);
        let writer_delete = stowage_writer_op_total.counter(&[name.clone(), "delete".into()]);

        let writer_batch_size = stowage_writer_batch_size.histogram(&[name.clone()]);
        let writer_commit_duration = stowage_writer_op_duration.histogram(&[name.clone(), "commit".into()]);

        let stowage_leak_total =
            registry.register_counter_vec("stowage_leak_total", "stowage suspected handle leaks", &["name", "kind"]);

        let leak_held_too_long = stowage_leak_total.counter(&[name.clone(), "held_too_long".into()]);
        let leak_too_many_consumers = stowage_leak_total.counter(&[name, "too_many_consumers".into()]);

        Self {
            cache_hit,
            cache_miss,
            cache_load,
            cache_insert,
            cache_evict,
            cache_remove,
            cache_clear,
            cache_entries,
            cache_load_duration,
            writer_enqueue,
            writer_commit,
            writer_error,
            writer_set,
            writer_delete,
            writer_batch_size,
            writer_commit_duration,
            leak_held_too_long,
            leak_too_many_consumers,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other stowage components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        Self::new("test", &NoopMetricsRegistry)
    }
}
