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

pub use stowage_common::{
    code::{CodingError, CodingResult, StoredEntity},
    error::{Error, ErrorKind, Result},
    event::{Event, EventListener},
    metrics::{model::Metrics, BoxedRegistry, RegistryOps},
    runtime::{SpawnHandle, Spawner},
    scope::Scope,
};
#[cfg(feature = "prometheus")]
pub use stowage_common::metrics::registry::prometheus::PrometheusMetricsRegistry;
pub use stowage_common::metrics::registry::noop::NoopMetricsRegistry;
pub use stowage_memory::{
    Cache, CacheBuilder, CacheConfig, CacheEntry, ForEachOptions, KeyedLock, KeyedReadGuard, KeyedWriteGuard,
    LeakDetectionConfig, LeakKind, LeakListener, LeakPolicy, LeakReport, RetainTree,
};
pub use stowage_store::{BatchOp, KvStore, MemoryBatch, MemoryStore, WriteBatch};

/// Utilities for tests.
#[cfg(feature = "test_utils")]
pub mod test_utils {
    pub use stowage_memory::test_utils::*;
    pub use stowage_store::test_utils::*;
}
