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

//! The eviction path of idle records.
//!
//! A record becomes idle when its last consumer leaves. Idle records are claimed for eviction with a CAS on their
//! retain word that only succeeds if no consumer arrived since, either at once (`cache_time == 0`) or when a delay
//! timer fires. A claimed dirty record goes to the writer; a claimed clean record leaves the map right away. After a
//! successful commit the writer hands the record back here to be removed or, if it got dirty again, rescheduled.

use std::sync::Arc;

use stowage_common::{code::StoredEntity, error::hex};

use crate::{
    record::{Flags, Record},
    shared::Shared,
    writer::Submission,
};

impl<T: StoredEntity> Shared<T> {
    /// Called by the consumer that released the record to zero.
    pub(crate) fn on_idle(self: &Arc<Self>, record: &Arc<Record<T>>, epoch: u64) {
        if record.is_evicted() {
            return;
        }
        if self.cache_time.is_zero() {
            if record.claim(epoch) {
                self.dispatch(record.clone());
            }
        } else {
            self.arm_timer(record, epoch);
        }
    }

    fn arm_timer(self: &Arc<Self>, record: &Arc<Record<T>>, epoch: u64) {
        let shared = Arc::downgrade(self);
        let target = record.clone();
        let delay = self.cache_time;
        let handle = self.spawner.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if target.claim(epoch) {
                tracing::trace!("[cache]: eviction timer of {} fired", hex(target.key()));
                shared.dispatch_async(target).await;
            }
        });
        record.arm_timer(handle.abort_handle());
    }

    /// Clean claimed records leave at once, dirty ones wait for the writer. Returns the record if it must be sent.
    fn route(&self, record: Arc<Record<T>>) -> Option<Arc<Record<T>>> {
        if !record.flags().contains(Flags::MODIFIED) {
            record.clear_queued();
            self.try_remove(&record);
            return None;
        }
        self.metrics.writer_enqueue.increase(1);
        Some(record)
    }

    fn dispatch(&self, record: Arc<Record<T>>) {
        let Some(record) = self.route(record) else { return };
        // Blocks when the writer falls behind, which throttles releases.
        if let Err(e) = self.tx.send(Submission::Entry(record)) {
            self.on_writer_gone(e.into_inner());
        }
    }

    async fn dispatch_async(&self, record: Arc<Record<T>>) {
        let Some(record) = self.route(record) else { return };
        if let Err(e) = self.tx.send_async(Submission::Entry(record)).await {
            self.on_writer_gone(e.into_inner());
        }
    }

    fn on_writer_gone(&self, submission: Submission<T>) {
        if let Submission::Entry(record) = submission {
            record.clear_queued();
            tracing::debug!(
                "[cache]: writer of cache {} is gone, {} stays in memory",
                self.name,
                hex(record.key())
            );
        }
    }

    /// Called by the writer after the record was committed.
    ///
    /// Returns `true` if the record got dirty again while idle and was claimed to be written in the next batch.
    pub(crate) fn on_written(self: &Arc<Self>, record: &Arc<Record<T>>) -> bool {
        let state = record.clear_queued();
        if state.consumers() > 0 || state.is_evicted() {
            return false;
        }
        if !record.flags().contains(Flags::MODIFIED) {
            self.try_remove(record);
            return false;
        }
        if self.cache_time.is_zero() {
            // Requeued by the writer itself, sending to its own channel could block forever.
            return record.claim(state.epoch());
        }
        self.arm_timer(record, state.epoch());
        false
    }
}
