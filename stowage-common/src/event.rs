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

use bytes::Bytes;

use crate::{code::StoredEntity, error::Error};

/// Reason why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The entry became idle, its pending writes were committed, and it was dropped from memory.
    Evict,
    /// The entry was deleted, the deletion was committed, and it was dropped from memory.
    Remove,
    /// The entry was dropped by pruning the whole realm.
    Clear,
}

/// Trait for the customized event listener.
///
/// Higher-level wrappers use it to keep secondary indexes in sync with the cache.
pub trait EventListener: Send + Sync + 'static {
    /// Associated entity type.
    type Entity: StoredEntity;

    /// Called when a cache entry leaves the in-memory cache with the reason.
    ///
    /// `value` is `None` if the key did not exist or was deleted.
    #[expect(unused_variables)]
    fn on_leave(&self, reason: Event, key: &Bytes, value: Option<&Self::Entity>) {}

    /// Called when a batched write to the underlying store failed.
    ///
    /// The affected entries stay dirty and are retried with the next batch.
    #[expect(unused_variables)]
    fn on_write_error(&self, error: &Error, entries: usize) {}
}
