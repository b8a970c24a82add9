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
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use stowage_common::{
    error::{hex, Error, Result},
    strict_assert,
};
use tokio::task::AbortHandle;

bitflags! {
    /// Persistence intent of a record, read fresh by the writer at commit time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// The value should be written to the store.
        const STORE = 0b0001;
        /// The key should be removed from the store.
        const DELETE = 0b0010;
        /// The in-memory state differs from what was last committed.
        const MODIFIED = 0b0100;
        /// The record is eligible for persistence.
        const PERSIST = 0b1000;
    }
}

const CONSUMERS_MASK: u64 = u32::MAX as u64;
const QUEUED: u64 = 1 << 32;
const EVICTED: u64 = 1 << 33;
const EPOCH_SHIFT: u32 = 34;
const EPOCH_ONE: u64 = 1 << EPOCH_SHIFT;

/// Snapshot of the packed retain word.
///
/// Layout: consumers in bits `0..32`, `QUEUED` in bit 32, `EVICTED` in bit 33, eviction epoch in the remaining bits.
/// Every retain bumps the epoch, so an eviction decided for an older epoch can never claim a re-retained record.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetainState(u64);

impl RetainState {
    pub fn consumers(self) -> u32 {
        (self.0 & CONSUMERS_MASK) as u32
    }

    pub fn epoch(self) -> u64 {
        self.0 >> EPOCH_SHIFT
    }

    pub fn is_queued(self) -> bool {
        self.0 & QUEUED != 0
    }

    pub fn is_evicted(self) -> bool {
        self.0 & EVICTED != 0
    }
}

impl Debug for RetainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainState")
            .field("consumers", &self.consumers())
            .field("epoch", &self.epoch())
            .field("queued", &self.is_queued())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

const PENDING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

#[derive(Debug)]
enum Publication {
    Pending,
    Ready,
    Failed(Error),
}

/// [`Record`] is the in-memory slot of one key.
///
/// Consumers, queue state and eviction epoch share one atomic word. Flags are a separate atomic byte. The value is
/// swapped atomically and published exactly once through a mutex/condvar latch.
pub(crate) struct Record<T> {
    key: Bytes,
    value: ArcSwapOption<T>,
    state: AtomicU64,
    flags: AtomicU8,

    published: AtomicU8,
    publication: Mutex<Publication>,
    cond: Condvar,

    timer: Mutex<Option<AbortHandle>>,
    update: Mutex<()>,
}

impl<T> Debug for Record<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("key", &hex(&self.key))
            .field("state", &self.retain_state())
            .field("flags", &self.flags())
            .finish()
    }
}

impl<T> Record<T> {
    /// Create an unpublished record, already retained by its creator.
    pub fn new(key: Bytes) -> Self {
        Self {
            key,
            value: ArcSwapOption::empty(),
            state: AtomicU64::new(1),
            flags: AtomicU8::new(0),
            published: AtomicU8::new(PENDING),
            publication: Mutex::new(Publication::Pending),
            cond: Condvar::new(),
            timer: Mutex::new(None),
            update: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Current in-memory value, without waiting for publication.
    pub fn value(&self) -> Option<Arc<T>> {
        self.value.load_full()
    }

    pub fn retain_state(&self) -> RetainState {
        RetainState(self.state.load(Ordering::Acquire))
    }

    pub fn consumers(&self) -> u32 {
        self.retain_state().consumers()
    }

    pub fn is_evicted(&self) -> bool {
        self.retain_state().is_evicted()
    }

    /// Register a consumer. Returns the new consumer count.
    ///
    /// Bumps the eviction epoch and, on a `0 => 1` transition, cancels a pending eviction timer.
    pub fn retain(&self) -> u32 {
        let old = RetainState(self.state.fetch_add(1 + EPOCH_ONE, Ordering::AcqRel));
        strict_assert!(old.consumers() < u32::MAX);
        if old.consumers() == 0 {
            self.cancel_timer();
        }
        tracing::trace!(
            "[record]: retain {} consumers: {} => {}",
            hex(&self.key),
            old.consumers(),
            old.consumers() + 1
        );
        old.consumers() + 1
    }

    /// Unregister a consumer. Returns the epoch to evict with if the record became idle.
    ///
    /// # Panics
    ///
    /// Panics if the record has no consumer left.
    pub fn release(&self) -> Option<u64> {
        let old = match self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s & CONSUMERS_MASK != 0).then(|| s - 1)
        }) {
            Ok(old) => RetainState(old),
            Err(_) => panic!("record {} released too many times", hex(&self.key)),
        };
        tracing::trace!(
            "[record]: release {} consumers: {} => {}",
            hex(&self.key),
            old.consumers(),
            old.consumers() - 1
        );
        (old.consumers() == 1).then(|| old.epoch())
    }

    /// Take the record for eviction if it is still idle at `epoch` and not already queued or evicted.
    pub fn claim(&self, epoch: u64) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let state = RetainState(s);
                (state.consumers() == 0 && state.epoch() == epoch && !state.is_queued() && !state.is_evicted())
                    .then_some(s | QUEUED)
            })
            .is_ok()
    }

    /// Mark the record queued regardless of its consumers.
    pub fn try_mark_queued(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s & (QUEUED | EVICTED) == 0).then_some(s | QUEUED)
            })
            .is_ok()
    }

    /// Clear the queued bit. Returns the state after the operation.
    pub fn clear_queued(&self) -> RetainState {
        RetainState(self.state.fetch_and(!QUEUED, Ordering::AcqRel) & !QUEUED)
    }

    pub fn mark_evicted(&self) {
        self.state.fetch_or(EVICTED, Ordering::AcqRel);
        self.cancel_timer();
    }

    pub fn arm_timer(&self, handle: AbortHandle) {
        if let Some(old) = self.timer.lock().replace(handle) {
            old.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn update_flags(&self, f: impl Fn(Flags) -> Flags) -> Flags {
        let old = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(Flags::from_bits_truncate(bits)).bits())
            })
            .unwrap_or_else(|bits| bits);
        Flags::from_bits_truncate(old)
    }

    /// Mark the value to be stored. `persist` overrides the persistence choice when given.
    pub fn mark_stored(&self, persist: Option<bool>) {
        self.update_flags(|flags| {
            let mut flags = (flags - Flags::DELETE) | Flags::STORE | Flags::MODIFIED;
            if let Some(persist) = persist {
                flags.set(Flags::PERSIST, persist);
            }
            flags
        });
    }

    pub fn mark_deleted(&self) {
        self.update_flags(|flags| (flags - Flags::STORE) | Flags::DELETE | Flags::MODIFIED);
    }

    /// Toggle persistence. Enabling it marks the record modified so the value reaches the store.
    pub fn set_persist(&self, persist: bool) {
        self.update_flags(|flags| match persist {
            true => flags | Flags::PERSIST | Flags::MODIFIED,
            false => flags - Flags::PERSIST,
        });
    }

    /// Clear `MODIFIED` and return the flags observed before, or `None` if the record was clean.
    pub fn take_pending(&self) -> Option<Flags> {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let flags = Flags::from_bits_truncate(bits);
                flags.contains(Flags::MODIFIED).then(|| (flags - Flags::MODIFIED).bits())
            })
            .ok()
            .map(Flags::from_bits_truncate)
    }

    /// Put back `MODIFIED` after a failed commit.
    pub fn restore_modified(&self) {
        self.flags.fetch_or(Flags::MODIFIED.bits(), Ordering::AcqRel);
    }

    /// Replace the value. Publishes the record if it was still pending.
    ///
    /// The value is swapped before the caller updates the flags, so a writer that observes the flags also observes
    /// the value.
    pub fn assign(&self, value: Option<Arc<T>>) {
        if self.published.load(Ordering::Acquire) != PENDING {
            self.value.store(value);
            return;
        }
        let mut publication = self.publication.lock();
        self.value.store(value);
        if matches!(*publication, Publication::Pending) {
            *publication = Publication::Ready;
            self.published.store(READY, Ordering::Release);
            self.cond.notify_all();
        }
    }

    /// Publish the loaded value. Only the first publication takes effect.
    pub fn publish(&self, value: Option<Arc<T>>, flags: Flags) -> bool {
        let mut publication = self.publication.lock();
        if !matches!(*publication, Publication::Pending) {
            return false;
        }
        self.value.store(value);
        self.update_flags(|f| f | flags);
        *publication = Publication::Ready;
        self.published.store(READY, Ordering::Release);
        self.cond.notify_all();
        true
    }

    /// Publish a load failure to every waiter. Only the first publication takes effect.
    pub fn publish_error(&self, error: Error) -> bool {
        let mut publication = self.publication.lock();
        if !matches!(*publication, Publication::Pending) {
            return false;
        }
        *publication = Publication::Failed(error);
        self.published.store(FAILED, Ordering::Release);
        self.cond.notify_all();
        true
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire) != PENDING
    }

    /// Block until the record is published.
    pub fn wait(&self) -> Result<()> {
        if self.published.load(Ordering::Acquire) == READY {
            return Ok(());
        }
        let mut publication = self.publication.lock();
        loop {
            match &*publication {
                Publication::Pending => self.cond.wait(&mut publication),
                Publication::Ready => return Ok(()),
                Publication::Failed(e) => return Err(e.clone()),
            }
        }
    }

    /// Serialize read-modify-write updates of the value.
    pub fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.update.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use stowage_common::error::ErrorKind;

    use super::*;

    fn record() -> Record<u64> {
        Record::new(Bytes::from_static(b"key"))
    }

    #[test]
    fn test_retain_release_epoch() {
        let r = record();
        assert_eq!(r.consumers(), 1);
        assert_eq!(r.retain(), 2);
        assert_eq!(r.retain_state().epoch(), 1);
        assert_eq!(r.release(), None);
        assert_eq!(r.release(), Some(1));
        assert_eq!(r.consumers(), 0);
    }

    #[test]
    #[should_panic(expected = "released too many times")]
    fn test_over_release_panics() {
        let r = record();
        r.release();
        r.release();
    }

    #[test]
    fn test_claim_requires_same_epoch() {
        let r = record();
        let epoch = r.release().unwrap();

        // A retain between the release and the claim invalidates the claim, even after another release.
        r.retain();
        assert!(!r.claim(epoch));
        let epoch2 = r.release().unwrap();
        assert_ne!(epoch, epoch2);
        assert!(!r.claim(epoch));

        assert!(r.claim(epoch2));
        assert!(r.retain_state().is_queued());
        assert!(!r.claim(epoch2));
        assert!(!r.try_mark_queued());

        assert!(!r.clear_queued().is_queued());
        r.mark_evicted();
        assert!(!r.claim(epoch2));
        assert!(!r.try_mark_queued());
    }

    #[test]
    fn test_claim_rejects_active_record() {
        let r = record();
        let epoch = r.retain_state().epoch();
        assert!(!r.claim(epoch));
        assert!(r.try_mark_queued());
    }

    #[test]
    fn test_flags() {
        let r = record();
        r.mark_stored(None);
        assert_eq!(r.flags(), Flags::STORE | Flags::MODIFIED);

        r.mark_deleted();
        assert_eq!(r.flags(), Flags::DELETE | Flags::MODIFIED);

        r.mark_stored(Some(true));
        assert_eq!(r.flags(), Flags::STORE | Flags::MODIFIED | Flags::PERSIST);

        assert_eq!(
            r.take_pending(),
            Some(Flags::STORE | Flags::MODIFIED | Flags::PERSIST)
        );
        assert_eq!(r.take_pending(), None);
        r.restore_modified();
        assert!(r.flags().contains(Flags::MODIFIED));
        r.take_pending();

        r.set_persist(false);
        assert_eq!(r.flags(), Flags::STORE);
        r.set_persist(true);
        assert_eq!(r.flags(), Flags::STORE | Flags::PERSIST | Flags::MODIFIED);
    }

    #[test]
    fn test_publish_exactly_once() {
        let r = Arc::new(record());
        let waiters = (0..4)
            .map(|_| {
                let r = r.clone();
                thread::spawn(move || {
                    r.wait().unwrap();
                    r.value().map(|v| *v)
                })
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(10));
        assert!(r.publish(Some(Arc::new(1)), Flags::PERSIST));
        assert!(!r.publish(Some(Arc::new(2)), Flags::empty()));
        assert!(!r.publish_error(Error::new(ErrorKind::Storage, "late")));

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(1));
        }
        assert_eq!(r.flags(), Flags::PERSIST);
    }

    #[test]
    fn test_publish_error_reaches_waiters() {
        let r = Arc::new(record());
        let waiter = {
            let r = r.clone();
            thread::spawn(move || r.wait())
        };
        assert!(r.publish_error(Error::new(ErrorKind::Storage, "boom")));
        assert_eq!(waiter.join().unwrap().unwrap_err().kind(), ErrorKind::Storage);
        assert_eq!(r.wait().unwrap_err().kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_assign_wins_over_late_publish() {
        let r = record();
        r.assign(Some(Arc::new(7)));
        assert!(r.is_published());
        assert!(!r.publish(Some(Arc::new(1)), Flags::PERSIST));
        assert_eq!(r.value().map(|v| *v), Some(7));
    }
}
