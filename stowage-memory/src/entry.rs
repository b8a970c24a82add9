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

use std::{fmt::Debug, panic::Location, sync::Arc};

use bytes::Bytes;
use stowage_common::{code::StoredEntity, error::Result};

use crate::{
    lock::KeyedLock,
    record::{Flags, Record},
    shared::Shared,
};

/// A retained handle of a cache entry.
///
/// Every handle counts as one consumer of the entry: the entry cannot be evicted while a handle is alive. Dropping the
/// handle releases it, `Clone` retains again.
///
/// The handle may be returned before the entry is published. Accessors that need the value block until then.
pub struct CacheEntry<T: StoredEntity> {
    shared: Arc<Shared<T>>,
    record: Arc<Record<T>>,
    trace: Option<u64>,
}

impl<T: StoredEntity> Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry").field("record", &self.record).finish()
    }
}

impl<T: StoredEntity> Drop for CacheEntry<T> {
    fn drop(&mut self) {
        if let Some(id) = self.trace {
            self.shared.leak.untrack(id);
        }
        if let Some(epoch) = self.record.release() {
            self.shared.on_idle(&self.record, epoch);
        }
    }
}

impl<T: StoredEntity> Clone for CacheEntry<T> {
    #[track_caller]
    fn clone(&self) -> Self {
        self.record.retain();
        Self::new(self.shared.clone(), self.record.clone(), Location::caller())
    }
}

impl<T: StoredEntity> CacheEntry<T> {
    /// Wrap an already retained record.
    pub(crate) fn new(shared: Arc<Shared<T>>, record: Arc<Record<T>>, location: &'static Location<'static>) -> Self {
        let trace = shared.leak.track(record.key(), location, record.consumers());
        Self { shared, record, trace }
    }

    pub(crate) fn record(&self) -> &Arc<Record<T>> {
        &self.record
    }

    /// Key of the entry.
    pub fn key(&self) -> &Bytes {
        self.record.key()
    }

    /// Block until the entry is published. Returns the load error if the load failed.
    pub fn wait(&self) -> Result<()> {
        self.record.wait()
    }

    /// Block until the entry is published and return its value.
    ///
    /// `None` means the key was not found or was deleted.
    pub fn get(&self) -> Result<Option<Arc<T>>> {
        self.record.wait()?;
        Ok(self.record.value())
    }

    /// The current in-memory value, without waiting for publication.
    pub fn value(&self) -> Option<Arc<T>> {
        self.record.value()
    }

    /// Block until the entry is published and tell whether it holds a value.
    pub fn exists(&self) -> Result<bool> {
        self.get().map(|v| v.is_some())
    }

    /// Call `f` with the value if it exists, then release the handle.
    ///
    /// The handle is released even if `f` panics.
    pub fn consume<R>(self, f: impl FnOnce(&T) -> R) -> Result<Option<R>> {
        Ok(self.get()?.map(|value| f(&value)))
    }

    /// Replace the value and mark it to be stored.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed, or if the entity key differs from the entry key.
    pub fn set(&self, entity: T) {
        self.write(Arc::new(entity), None);
    }

    /// Replace the value with one computed from the current one.
    ///
    /// Waits for publication first. Updates of one entry are serialized.
    pub fn update(&self, f: impl FnOnce(Option<&T>) -> T) -> Result<()> {
        self.record.wait()?;
        let _guard = self.record.lock_update();
        let current = self.record.value();
        let entity = f(current.as_deref());
        self.write_locked(Arc::new(entity), None);
        Ok(())
    }

    /// Clear the value and mark the key to be removed from the store.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    pub fn delete(&self) {
        let _guard = self.record.lock_update();
        self.delete_locked();
    }

    /// Enable or disable persistence of the value.
    ///
    /// # Panics
    ///
    /// Panics if the cache is closed.
    pub fn persist(&self, persist: bool) {
        self.shared.assert_open();
        self.record.set_persist(persist);
    }

    /// Run `f` while holding `ids` exclusively in `lock`.
    pub fn transaction<I, R>(&self, lock: &KeyedLock, ids: I, f: impl FnOnce(&Self) -> R) -> R
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let _guard = lock.lock(ids);
        f(self)
    }

    /// Run `f` while holding `ids` shared in `lock`.
    pub fn r_transaction<I, R>(&self, lock: &KeyedLock, ids: I, f: impl FnOnce(&Self) -> R) -> R
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let _guard = lock.read(ids);
        f(self)
    }

    /// Release the handle. Same as dropping it.
    pub fn release(self) {}

    /// Number of live handles of the entry.
    pub fn consumers(&self) -> u32 {
        self.record.consumers()
    }

    /// Whether the entry holds changes not committed yet.
    pub fn is_modified(&self) -> bool {
        self.record.flags().contains(Flags::MODIFIED)
    }

    /// Whether the entry is marked deleted.
    pub fn is_deleted(&self) -> bool {
        self.record.flags().contains(Flags::DELETE)
    }

    /// Whether the entry is eligible for persistence.
    pub fn is_persisted(&self) -> bool {
        self.record.flags().contains(Flags::PERSIST)
    }

    /// Whether the entry has been published.
    pub fn is_published(&self) -> bool {
        self.record.is_published()
    }

    /// Replace the value. `persist` overrides the persistence choice when given.
    pub(crate) fn write(&self, value: Arc<T>, persist: Option<bool>) {
        let _guard = self.record.lock_update();
        self.write_locked(value, persist);
    }

    /// [`CacheEntry::write`] for callers already holding the record's update lock.
    ///
    /// Value and flags change together under the lock, so a concurrent delete cannot leave a value flagged deleted.
    pub(crate) fn write_locked(&self, value: Arc<T>, persist: Option<bool>) {
        self.shared.assert_open();
        assert_eq!(
            &value.storage_key(),
            self.record.key(),
            "entity key differs from the entry key"
        );
        self.record.assign(Some(value));
        self.record.mark_stored(persist);
        self.shared.metrics.cache_insert.increase(1);
    }

    /// [`CacheEntry::delete`] for callers already holding the record's update lock.
    pub(crate) fn delete_locked(&self) {
        self.shared.assert_open();
        self.record.assign(None);
        self.record.mark_deleted();
    }
}
