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

//! Store wrappers for tests: operation counting, slow reads and injected failures.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use stowage_common::error::{Error, Result};

use crate::store::{BatchOp, KvStore, WriteBatch};

/// Failure injected by [`RecordingStore`].
#[derive(Debug, thiserror::Error)]
pub enum InjectedFailure {
    /// A read was asked to fail.
    #[error("injected read failure")]
    Read,
    /// A commit was asked to fail.
    #[error("injected commit failure")]
    Commit,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
struct Recorder {
    reads: AtomicUsize,
    commits: AtomicUsize,
    commits_started: AtomicUsize,
    failed_commits: AtomicUsize,
    read_delay_ms: AtomicU64,
    commit_delay_ms: AtomicU64,
    fail_reads: AtomicUsize,
    fail_commits: AtomicUsize,
    history: Mutex<Vec<Vec<BatchOp>>>,
}

/// A [`KvStore`] wrapper that counts reads and commits and can slow down reads or fail operations on demand.
///
/// Clones and realm views share the same recorder.
#[derive(Debug, Clone)]
pub struct RecordingStore<S: KvStore> {
    inner: S,
    recorder: Arc<Recorder>,
}

impl<S: KvStore> RecordingStore<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recorder: Arc::default(),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of `get`/`has` calls.
    pub fn reads(&self) -> usize {
        self.recorder.reads.load(Ordering::Acquire)
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.recorder.commits.load(Ordering::Acquire)
    }

    /// Number of commits entered, including running and failed ones.
    pub fn commits_started(&self) -> usize {
        self.recorder.commits_started.load(Ordering::Acquire)
    }

    /// Number of failed commits.
    pub fn failed_commits(&self) -> usize {
        self.recorder.failed_commits.load(Ordering::Acquire)
    }

    /// Operations of every successful commit, in commit order.
    pub fn history(&self) -> Vec<Vec<BatchOp>> {
        self.recorder.history.lock().clone()
    }

    /// Make every following read sleep for `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.recorder
            .read_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Make every following commit sleep for `delay` before it applies.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.recorder
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Fail the next `n` reads.
    pub fn fail_next_reads(&self, n: usize) {
        self.recorder.fail_reads.store(n, Ordering::Release);
    }

    /// Fail the next `n` commits.
    pub fn fail_next_commits(&self, n: usize) {
        self.recorder.fail_commits.store(n, Ordering::Release);
    }

    fn on_read(&self) -> Result<()> {
        self.recorder.reads.fetch_add(1, Ordering::AcqRel);
        let delay = self.recorder.read_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if take_failure(&self.recorder.fail_reads) {
            return Err(Error::storage("read failed", InjectedFailure::Read));
        }
        Ok(())
    }
}

impl<S: KvStore> KvStore for RecordingStore<S> {
    type Batch = RecordingBatch<S::Batch>;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.on_read()?;
        self.inner.get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        self.on_read()?;
        self.inner.has(key)
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        self.inner.iterate(prefix, f)
    }

    fn iterate_keys(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8]) -> bool) -> Result<()> {
        self.inner.iterate_keys(prefix, f)
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<bool> {
        self.inner.delete_prefix(prefix)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    fn realm(&self) -> &Bytes {
        self.inner.realm()
    }

    fn with_realm(&self, realm: impl Into<Bytes>) -> Self {
        Self {
            inner: self.inner.with_realm(realm),
            recorder: self.recorder.clone(),
        }
    }

    fn batched(&self) -> Self::Batch {
        RecordingBatch {
            inner: self.inner.batched(),
            ops: vec![],
            recorder: self.recorder.clone(),
        }
    }
}

/// Write batch of [`RecordingStore`].
#[derive(Debug)]
pub struct RecordingBatch<B: WriteBatch> {
    inner: B,
    ops: Vec<BatchOp>,
    recorder: Arc<Recorder>,
}

impl<B: WriteBatch> WriteBatch for RecordingBatch<B> {
    fn set(&mut self, key: Bytes, value: Bytes) {
        self.ops.push(BatchOp::Set {
            key: key.clone(),
            value: value.clone(),
        });
        self.inner.set(key, value);
    }

    fn delete(&mut self, key: Bytes) {
        self.ops.push(BatchOp::Delete { key: key.clone() });
        self.inner.delete(key);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn commit(self) -> Result<()> {
        self.recorder.commits_started.fetch_add(1, Ordering::AcqRel);
        let delay = self.recorder.commit_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if take_failure(&self.recorder.fail_commits) {
            self.recorder.failed_commits.fetch_add(1, Ordering::AcqRel);
            return Err(Error::storage("commit failed", InjectedFailure::Commit));
        }
        self.inner.commit()?;
        self.recorder.commits.fetch_add(1, Ordering::AcqRel);
        self.recorder.history.lock().push(self.ops);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test_log::test]
    fn test_counts_and_history() {
        let store = RecordingStore::new(MemoryStore::new());
        assert_eq!(store.get(b"a").unwrap(), None);
        store.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        assert!(store.has(b"a").unwrap());
        assert_eq!(store.reads(), 2);
        assert_eq!(store.commits(), 1);
        assert_eq!(
            store.history(),
            vec![vec![BatchOp::Set {
                key: Bytes::from("a"),
                value: Bytes::from("1")
            }]]
        );
    }

    #[test_log::test]
    fn test_injected_failures() {
        let store = RecordingStore::new(MemoryStore::new());
        store.fail_next_commits(1);
        let err = store.set(Bytes::from("a"), Bytes::from("1")).unwrap_err();
        assert!(err.downcast_ref::<InjectedFailure>().is_some());
        assert_eq!(store.failed_commits(), 1);
        assert!(!store.inner().has(b"a").unwrap());

        store.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        assert!(store.inner().has(b"a").unwrap());

        store.fail_next_reads(1);
        assert!(store.get(b"a").is_err());
        assert!(store.get(b"a").is_ok());
    }

    #[test_log::test]
    fn test_realm_views_share_recorder() {
        let store = RecordingStore::new(MemoryStore::new());
        let other = store.with_realm("other");
        other.get(b"x").unwrap();
        assert_eq!(store.reads(), 1);
        assert_eq!(other.realm(), &Bytes::from("other"));
    }
}
