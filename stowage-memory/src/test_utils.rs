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

//! Entities and listeners for tests.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use stowage_common::{
    code::{CodingResult, StoredEntity},
    error::Error,
    event::{Event, EventListener},
};

use crate::leak::{LeakListener, LeakReport};

/// A counter entity encoded as its decimal representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    /// Storage key.
    pub key: Bytes,
    /// Counter value.
    pub value: u64,
}

impl Counter {
    /// Create a counter.
    pub fn new(key: impl Into<Bytes>, value: u64) -> Self {
        Self { key: key.into(), value }
    }
}

impl StoredEntity for Counter {
    fn storage_key(&self) -> Bytes {
        self.key.clone()
    }

    fn storage_value(&self) -> Bytes {
        Bytes::from(self.value.to_string())
    }

    fn from_key_value(key: &[u8], value: &[u8]) -> CodingResult<Self> {
        let value = std::str::from_utf8(value)?.parse()?;
        Ok(Self {
            key: Bytes::copy_from_slice(key),
            value,
        })
    }
}

/// An event listener recording every event.
#[derive(Debug)]
pub struct RecordingListener<T> {
    leaves: Arc<Mutex<Vec<(Event, Bytes, Option<T>)>>>,
    write_errors: Arc<Mutex<Vec<(String, usize)>>>,
}

impl<T> Clone for RecordingListener<T> {
    fn clone(&self) -> Self {
        Self {
            leaves: self.leaves.clone(),
            write_errors: self.write_errors.clone(),
        }
    }
}

impl<T> Default for RecordingListener<T> {
    fn default() -> Self {
        Self {
            leaves: Default::default(),
            write_errors: Default::default(),
        }
    }
}

impl<T> EventListener for RecordingListener<T>
where
    T: StoredEntity + Clone,
{
    type Entity = T;

    fn on_leave(&self, reason: Event, key: &Bytes, value: Option<&T>) {
        self.leaves.lock().push((reason, key.clone(), value.cloned()));
    }

    fn on_write_error(&self, error: &Error, entries: usize) {
        self.write_errors.lock().push((error.to_string(), entries));
    }
}

impl<T> RecordingListener<T> {
    /// Get all recorded leave events.
    pub fn leaves(&self) -> MutexGuard<'_, Vec<(Event, Bytes, Option<T>)>> {
        self.leaves.lock()
    }

    /// Get all recorded write failures with the number of affected entries.
    pub fn write_errors(&self) -> MutexGuard<'_, Vec<(String, usize)>> {
        self.write_errors.lock()
    }
}

/// A leak listener collecting reports.
#[derive(Debug, Clone, Default)]
pub struct RecordingLeakListener {
    reports: Arc<Mutex<Vec<LeakReport>>>,
}

impl LeakListener for RecordingLeakListener {
    fn on_leak(&self, report: &LeakReport) {
        self.reports.lock().push(report.clone());
    }
}

impl RecordingLeakListener {
    /// Get all collected reports.
    pub fn reports(&self) -> MutexGuard<'_, Vec<LeakReport>> {
        self.reports.lock()
    }
}
