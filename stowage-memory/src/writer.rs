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
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use stowage_common::{
    code::StoredEntity,
    error::{Error, ErrorKind, Result},
    event::EventListener,
    metrics::model::Metrics,
};
use stowage_store::{KvStore, WriteBatch};
use tokio::{sync::oneshot, time::Instant};

use crate::{
    record::{Flags, Record},
    shared::Shared,
};

pub(crate) enum Submission<T> {
    /// A claimed record to persist.
    Entry(Arc<Record<T>>),
    /// Commit everything pending now and report the result.
    Wait { tx: oneshot::Sender<Result<()>> },
    /// Commit (or drop, without `drain`) everything pending and exit.
    Close { drain: bool },
}

impl<T> Debug for Submission<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry(record) => f.debug_tuple("Entry").field(record).finish(),
            Self::Wait { .. } => f.debug_struct("Wait").finish(),
            Self::Close { drain } => f.debug_struct("Close").field("drain", drain).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub keys_only: bool,
    pub persistence_enabled: bool,
}

#[derive(Debug, Default)]
struct BatchStats {
    sets: usize,
    deletes: usize,
}

/// The single background task that persists dirty records in batches.
///
/// A batch is committed when it reaches `batch_size`, when `batch_timeout` elapsed since its first record, or on a
/// flush barrier. Flags are read when the batch is built, not when records were enqueued.
pub(crate) struct Writer<T: StoredEntity, S: KvStore> {
    rx: flume::Receiver<Submission<T>>,
    shared: Weak<Shared<T>>,
    store: S,
    config: WriterConfig,

    metrics: Arc<Metrics>,
    listener: Option<Arc<dyn EventListener<Entity = T>>>,

    batch: Vec<Arc<Record<T>>>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    deadline: Option<Instant>,
}

impl<T: StoredEntity, S: KvStore> Writer<T, S> {
    pub fn new(
        rx: flume::Receiver<Submission<T>>,
        shared: Weak<Shared<T>>,
        store: S,
        config: WriterConfig,
        metrics: Arc<Metrics>,
        listener: Option<Arc<dyn EventListener<Entity = T>>>,
    ) -> Self {
        Self {
            rx,
            shared,
            store,
            config,
            metrics,
            listener,
            batch: vec![],
            waiters: vec![],
            deadline: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.commit().await;
                }
                submission = self.rx.recv_async() => match submission {
                    Ok(Submission::Entry(record)) => {
                        self.push(record);
                        if self.batch.len() >= self.config.batch_size {
                            self.commit().await;
                        }
                    }
                    Ok(Submission::Wait { tx }) => {
                        self.waiters.push(tx);
                        self.commit().await;
                    }
                    Ok(Submission::Close { drain }) => {
                        self.close(drain).await;
                        break;
                    }
                    // Every sender is gone.
                    Err(_) => {
                        self.close(true).await;
                        break;
                    }
                }
            }
        }
        tracing::debug!("[writer]: writer exits");
    }

    fn push(&mut self, record: Arc<Record<T>>) {
        tracing::trace!("[writer]: push {record:?}");
        if self.batch.is_empty() {
            self.deadline = Some(Instant::now() + self.config.batch_timeout);
        }
        self.batch.push(record);
    }

    async fn close(&mut self, drain: bool) {
        while let Ok(submission) = self.rx.try_recv() {
            match submission {
                Submission::Entry(record) => self.batch.push(record),
                Submission::Wait { tx } => self.waiters.push(tx),
                Submission::Close { .. } => {}
            }
        }
        if drain {
            // Commits may requeue records dirtied meanwhile.
            while !self.batch.is_empty() && self.commit().await {}
            if !self.batch.is_empty() {
                tracing::error!(
                    "[writer]: writer closed with {} uncommitted entries",
                    self.batch.len()
                );
            }
            return;
        }
        tracing::info!("[writer]: writer closed without drain, dropped {} entries", self.batch.len());
        for record in self.batch.drain(..) {
            record.clear_queued();
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::closed("writer closed without drain")));
        }
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "stowage::memory::writer::commit"))]
    async fn commit(&mut self) -> bool {
        self.deadline = None;
        let waiters = std::mem::take(&mut self.waiters);
        if self.batch.is_empty() {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
            return true;
        }

        let records = std::mem::take(&mut self.batch);
        let store = self.store.clone();
        let config = self.config.clone();
        let batch = records.clone();
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || Self::write(&store, &batch, &config))
            .await
            .map_err(|e| Error::new(ErrorKind::Join, "writer commit task failed").with_source(e))
            .and_then(|r| r);

        match result {
            Ok(stats) => {
                self.metrics.writer_commit.increase(1);
                self.metrics.writer_set.increase(stats.sets as _);
                self.metrics.writer_delete.increase(stats.deletes as _);
                self.metrics.writer_batch_size.record(records.len() as _);
                self.metrics
                    .writer_commit_duration
                    .record(start.elapsed().as_secs_f64());
                tracing::trace!(
                    "[writer]: committed {} entries, sets: {}, deletes: {}",
                    records.len(),
                    stats.sets,
                    stats.deletes
                );

                match self.shared.upgrade() {
                    Some(shared) => {
                        for record in records {
                            if shared.on_written(&record) {
                                self.push(record);
                            }
                        }
                    }
                    None => {
                        for record in records {
                            record.clear_queued();
                        }
                    }
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                true
            }
            Err(e) => {
                tracing::error!(
                    "[writer]: failed to commit {} entries, they stay dirty and are retried: {e}",
                    records.len()
                );
                if e.kind() == ErrorKind::Join {
                    // The task died before it could put the flags back.
                    for record in records.iter() {
                        record.restore_modified();
                    }
                }
                self.metrics.writer_error.increase(1);
                if let Some(listener) = self.listener.as_ref() {
                    listener.on_write_error(&e, records.len());
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                // Keep the records queued for the next cycle.
                for record in records {
                    self.push(record);
                }
                false
            }
        }
    }

    /// Build and commit one store batch. Runs on the blocking pool.
    fn write(store: &S, records: &[Arc<Record<T>>], config: &WriterConfig) -> Result<BatchStats> {
        let mut batch = store.batched();
        let mut stats = BatchStats::default();
        let mut taken = Vec::with_capacity(records.len());

        for record in records {
            if record.is_evicted() {
                continue;
            }
            let Some(flags) = record.take_pending() else {
                continue;
            };
            taken.push(record);
            if !config.persistence_enabled {
                continue;
            }
            let key = record.key().clone();
            if flags.contains(Flags::DELETE) {
                batch.delete(key);
                stats.deletes += 1;
            } else if flags.contains(Flags::STORE | Flags::PERSIST) {
                match record.value() {
                    Some(value) => {
                        let bytes = match config.keys_only {
                            true => Bytes::new(),
                            false => value.storage_value(),
                        };
                        batch.set(key, bytes);
                        stats.sets += 1;
                    }
                    // Deleted after the flags were taken, the delete is committed with the next batch anyway.
                    None => {
                        batch.delete(key);
                        stats.deletes += 1;
                    }
                }
            }
        }

        if batch.is_empty() {
            batch.cancel();
            return Ok(stats);
        }
        batch.commit().inspect_err(|_| {
            for record in taken {
                record.restore_modified();
            }
        })?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use stowage_store::{test_utils::RecordingStore, BatchOp, MemoryStore};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::test_utils::Counter;

    type TestStore = RecordingStore<MemoryStore>;

    fn spawn_writer(
        store: TestStore,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> (flume::Sender<Submission<Counter>>, JoinHandle<()>) {
        let (tx, rx) = flume::bounded(64);
        let config = WriterConfig {
            batch_size,
            batch_timeout,
            keys_only: false,
            persistence_enabled: true,
        };
        let writer = Writer::new(rx, Weak::new(), store, config, Arc::new(Metrics::noop()), None);
        (tx, tokio::spawn(writer.run()))
    }

    fn dirty(key: &'static str, value: u64) -> Arc<Record<Counter>> {
        let record = Arc::new(Record::new(Bytes::from_static(key.as_bytes())));
        record.publish(
            Some(Arc::new(Counter::new(key, value))),
            Flags::STORE | Flags::MODIFIED | Flags::PERSIST,
        );
        record
    }

    async fn barrier(tx: &flume::Sender<Submission<Counter>>) -> Result<()> {
        let (wtx, wrx) = oneshot::channel();
        tx.send_async(Submission::Wait { tx: wtx }).await.unwrap();
        wrx.await.unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_full_batch_commits_without_barrier() {
        let store = RecordingStore::new(MemoryStore::new());
        let (tx, handle) = spawn_writer(store.clone(), 2, Duration::from_secs(3600));

        tx.send_async(Submission::Entry(dirty("a", 1))).await.unwrap();
        tx.send_async(Submission::Entry(dirty("b", 2))).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.commits() == 0 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(store.history()[0].len(), 2);

        tx.send_async(Submission::Close { drain: true }).await.unwrap();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_batch_timeout_commits_partial_batch() {
        let store = RecordingStore::new(MemoryStore::new());
        let (tx, handle) = spawn_writer(store.clone(), 1024, Duration::from_millis(10));

        tx.send_async(Submission::Entry(dirty("a", 1))).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.commits() == 0 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(store.inner().get(b"a").unwrap(), Some(Bytes::from_static(b"1")));

        drop(tx);
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_flags_are_read_at_commit_time() {
        let store = RecordingStore::new(MemoryStore::new());
        let (tx, handle) = spawn_writer(store.clone(), 1024, Duration::from_secs(3600));

        let stale = dirty("a", 1);
        tx.send_async(Submission::Entry(stale.clone())).await.unwrap();
        stale.mark_deleted();
        let clean = dirty("b", 2);
        clean.take_pending();
        tx.send_async(Submission::Entry(clean)).await.unwrap();

        barrier(&tx).await.unwrap();
        assert_eq!(
            store.history(),
            vec![vec![BatchOp::Delete {
                key: Bytes::from_static(b"a")
            }]]
        );
        assert!(!stale.flags().contains(Flags::MODIFIED));

        tx.send_async(Submission::Close { drain: true }).await.unwrap();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_commit_keeps_records_dirty() {
        let store = RecordingStore::new(MemoryStore::new());
        let (tx, handle) = spawn_writer(store.clone(), 1024, Duration::from_secs(3600));
        store.fail_next_commits(1);

        let record = dirty("a", 7);
        tx.send_async(Submission::Entry(record.clone())).await.unwrap();

        assert!(barrier(&tx).await.is_err());
        assert!(record.flags().contains(Flags::MODIFIED));
        assert_eq!(store.inner().get(b"a").unwrap(), None);

        barrier(&tx).await.unwrap();
        assert!(!record.flags().contains(Flags::MODIFIED));
        assert_eq!(store.inner().get(b"a").unwrap(), Some(Bytes::from_static(b"7")));
        assert_eq!(store.failed_commits(), 1);

        tx.send_async(Submission::Close { drain: true }).await.unwrap();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_close_without_drain_drops_pending() {
        let store = RecordingStore::new(MemoryStore::new());
        let (tx, handle) = spawn_writer(store.clone(), 1024, Duration::from_secs(3600));

        tx.send_async(Submission::Entry(dirty("a", 1))).await.unwrap();
        tx.send_async(Submission::Close { drain: false }).await.unwrap();
        handle.await.unwrap();

        assert_eq!(store.commits(), 0);
        assert_eq!(store.inner().get(b"a").unwrap(), None);
    }
}
