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

use std::hash::BuildHasher;

use ahash::RandomState;
use itertools::Itertools;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A striped multi-key lock.
///
/// Ids are hashed onto a fixed set of `RwLock` stripes. Multi-id acquisitions lock the distinct stripes in ascending
/// order, so two transactions over overlapping ids never deadlock.
#[derive(Debug)]
pub struct KeyedLock {
    stripes: Box<[RwLock<()>]>,
    hasher: RandomState,
}

/// Exclusive guard of [`KeyedLock::lock`].
#[must_use = "the ids are unlocked when the guard is dropped"]
pub struct KeyedWriteGuard<'a> {
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
}

/// Shared guard of [`KeyedLock::read`].
#[must_use = "the ids are unlocked when the guard is dropped"]
pub struct KeyedReadGuard<'a> {
    _guards: Vec<RwLockReadGuard<'a, ()>>,
}

impl Default for KeyedLock {
    fn default() -> Self {
        Self::new(64)
    }
}

impl KeyedLock {
    /// Create a lock with `stripes` stripes.
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| RwLock::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn stripes<I>(&self, ids: I) -> Vec<usize>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        ids.into_iter()
            .map(|id| self.hasher.hash_one(id.as_ref()) as usize % self.stripes.len())
            .sorted_unstable()
            .dedup()
            .collect()
    }

    /// Lock `ids` exclusively.
    pub fn lock<I>(&self, ids: I) -> KeyedWriteGuard<'_>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        KeyedWriteGuard {
            _guards: self.stripes(ids).into_iter().map(|i| self.stripes[i].write()).collect(),
        }
    }

    /// Lock `ids` shared.
    pub fn read<I>(&self, ids: I) -> KeyedReadGuard<'_>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        KeyedReadGuard {
            _guards: self.stripes(ids).into_iter().map(|i| self.stripes[i].read()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;

    #[test]
    fn test_duplicated_ids_do_not_self_deadlock() {
        let lock = KeyedLock::new(4);
        let _guard = lock.lock(["a", "a", "b"]);
    }

    #[test]
    fn test_shared_readers() {
        let lock = KeyedLock::new(4);
        let _r1 = lock.read(["a"]);
        let _r2 = lock.read(["a", "b"]);
    }

    #[test]
    fn test_exclusive_across_overlapping_ids() {
        let lock = Arc::new(KeyedLock::new(16));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles = (0..8)
            .map(|i| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    // Ids in different orders across threads.
                    let ids = if i % 2 == 0 { ["x", "y"] } else { ["y", "x"] };
                    for _ in 0..500 {
                        let _guard = lock.lock(ids);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
