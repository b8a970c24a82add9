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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_common::error::{Error, ErrorKind, Result};

use crate::leak::LeakDetectionConfig;

/// Configuration of a write-back cache.
///
/// Every field has a default, so partial documents deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cache, used as metrics label and in logs.
    pub name: String,
    /// How long an unreferenced entry stays in memory before it is evicted. Zero evicts as soon as unreferenced.
    pub cache_time: Duration,
    /// Read from and write to the store. When disabled the cache is memory only.
    pub persistence_enabled: bool,
    /// Maximum entries per store batch.
    pub batch_size: usize,
    /// Maximum time an entry waits in a batch before it is committed.
    pub batch_timeout: Duration,
    /// Capacity of the writer queue. Releases block while it is full.
    pub queue_capacity: usize,
    /// Number of map shards.
    pub shards: usize,
    /// Persist keys with empty values.
    pub keys_only: bool,
    /// Segment sizes used to split keys into partitions. Empty disables partition tracking.
    pub key_partition_sizes: Vec<usize>,
    /// Handle leak detection.
    pub leak_detection: LeakDetectionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "stowage".to_string(),
            cache_time: Duration::ZERO,
            persistence_enabled: true,
            batch_size: 1024,
            batch_timeout: Duration::from_millis(50),
            queue_capacity: 4096,
            shards: 8,
            keys_only: false,
            key_partition_sizes: vec![],
            leak_detection: LeakDetectionConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &'static str, value: &dyn ToString| {
            Err(Error::new(ErrorKind::Config, "invalid cache configuration")
                .with_context("name", &self.name)
                .with_context("field", field)
                .with_context("value", value.to_string()))
        };
        if self.batch_size == 0 {
            return invalid("batch_size", &self.batch_size);
        }
        if self.shards == 0 {
            return invalid("shards", &self.shards);
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity", &self.queue_capacity);
        }
        if self.key_partition_sizes.contains(&0) {
            return invalid("key_partition_sizes", &format!("{:?}", self.key_partition_sizes));
        }
        if self.leak_detection.enabled && self.leak_detection.check_interval.is_zero() {
            return invalid(
                "leak_detection.check_interval",
                &format!("{:?}", self.leak_detection.check_interval),
            );
        }
        Ok(())
    }
}
