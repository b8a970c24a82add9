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

use std::fmt::Debug;

use bytes::Bytes;
use stowage_common::error::Result;

/// A single operation staged in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Write `value` under `key`.
    Set {
        /// Key within the realm.
        key: Bytes,
        /// Encoded value.
        value: Bytes,
    },
    /// Remove `key`.
    Delete {
        /// Key within the realm.
        key: Bytes,
    },
}

impl BatchOp {
    /// The key the operation applies to.
    pub fn key(&self) -> &Bytes {
        match self {
            BatchOp::Set { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// A group of writes applied to the store as one unit.
///
/// Dropping a batch without calling [`WriteBatch::commit`] discards it.
pub trait WriteBatch: Send + 'static {
    /// Stage a write.
    fn set(&mut self, key: Bytes, value: Bytes);

    /// Stage a removal.
    fn delete(&mut self, key: Bytes);

    /// Number of staged operations.
    fn len(&self) -> usize;

    /// Whether nothing is staged.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply every staged operation atomically.
    fn commit(self) -> Result<()>;

    /// Discard every staged operation.
    fn cancel(self)
    where
        Self: Sized,
    {
        drop(self)
    }
}

/// The key/value store consumed by the cache.
///
/// A store value is a view scoped to one realm: every key it reads or writes lives under the realm. Views of other
/// realms over the same data are created with [`KvStore::with_realm`].
///
/// All methods are blocking. The cache calls them from the loading thread or from the blocking pool of its spawner.
pub trait KvStore: Send + Sync + 'static + Debug + Clone {
    /// Batch type returned by [`KvStore::batched`].
    type Batch: WriteBatch;

    /// Read the value of `key`, `None` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Whether `key` exists.
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.get(key).map(|v| v.is_some())
    }

    /// Write a single value.
    fn set(&self, key: Bytes, value: Bytes) -> Result<()> {
        let mut batch = self.batched();
        batch.set(key, value);
        batch.commit()
    }

    /// Remove a single key.
    fn delete(&self, key: Bytes) -> Result<()> {
        let mut batch = self.batched();
        batch.delete(key);
        batch.commit()
    }

    /// Visit every entry whose key starts with `prefix`, in key order.
    ///
    /// Iteration stops early when `f` returns `false`.
    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<()>;

    /// Visit every key starting with `prefix`, in key order.
    fn iterate_keys(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8]) -> bool) -> Result<()> {
        self.iterate(prefix, &mut |key, _| f(key))
    }

    /// Remove every key starting with `prefix`. Returns whether anything was removed.
    fn delete_prefix(&self, prefix: &[u8]) -> Result<bool>;

    /// Remove every key of the realm.
    fn clear(&self) -> Result<()> {
        self.delete_prefix(&[]).map(|_| ())
    }

    /// The realm of this view.
    fn realm(&self) -> &Bytes;

    /// A view of the same data scoped to another realm.
    fn with_realm(&self, realm: impl Into<Bytes>) -> Self;

    /// Start a new write batch.
    fn batched(&self) -> Self::Batch;
}
