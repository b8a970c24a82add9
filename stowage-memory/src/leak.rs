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
    fmt::Display,
    panic::Location,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stowage_common::{error::hex, metrics::model::Metrics, runtime::Spawner};

/// What to do when a suspected handle leak is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LeakPolicy {
    /// Log and notify the listener.
    #[default]
    Warn,
    /// Log, notify the listener, then panic on the reporting thread.
    Panic,
}

/// Leak detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakDetectionConfig {
    /// Track every handle with its creation site.
    pub enabled: bool,
    /// A handle held longer than this is reported once.
    pub max_hold_time: Duration,
    /// A retain beyond this many consumers of one entry is reported at once.
    pub max_consumers: u32,
    /// Interval of the background scan for handles held too long.
    pub check_interval: Duration,
    /// Reaction to a report.
    pub policy: LeakPolicy,
}

impl Default for LeakDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_hold_time: Duration::from_secs(60),
            max_consumers: 1024,
            check_interval: Duration::from_secs(1),
            policy: LeakPolicy::Warn,
        }
    }
}

impl LeakDetectionConfig {
    /// Enabled leak detection with default thresholds.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Set the maximum hold time of a handle.
    pub fn with_max_hold_time(mut self, max_hold_time: Duration) -> Self {
        self.max_hold_time = max_hold_time;
        self
    }

    /// Set the maximum consumers of one entry.
    pub fn with_max_consumers(mut self, max_consumers: u32) -> Self {
        self.max_consumers = max_consumers;
        self
    }

    /// Set the background scan interval.
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Set the reaction to a report.
    pub fn with_policy(mut self, policy: LeakPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Kind of a suspected leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakKind {
    /// A handle outlived `max_hold_time`.
    HeldTooLong,
    /// An entry gained more than `max_consumers` consumers.
    TooManyConsumers,
}

/// A suspected handle leak.
#[derive(Debug, Clone)]
pub struct LeakReport {
    /// Kind of the report.
    pub kind: LeakKind,
    /// Key of the entry.
    pub key: Bytes,
    /// Where the offending handle was created.
    pub location: &'static Location<'static>,
    /// How long the handle has been held.
    pub held_for: Duration,
    /// Consumers of the entry when the handle was created.
    pub consumers: u32,
}

impl Display for LeakReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LeakKind::HeldTooLong => write!(
                f,
                "handle of {} created at {} held for {:?}",
                hex(&self.key),
                self.location,
                self.held_for
            ),
            LeakKind::TooManyConsumers => write!(
                f,
                "entry {} retained by {} consumers, last at {}",
                hex(&self.key),
                self.consumers,
                self.location
            ),
        }
    }
}

/// Receiver of leak reports.
pub trait LeakListener: Send + Sync + 'static {
    /// Called for every report, before the policy applies.
    fn on_leak(&self, report: &LeakReport);
}

#[derive(Debug)]
struct Trace {
    key: Bytes,
    location: &'static Location<'static>,
    consumers: u32,
    since: Instant,
    reported: bool,
}

/// Tracks live handles and reports the suspicious ones.
pub(crate) struct LeakMonitor {
    config: LeakDetectionConfig,
    traces: Mutex<HashMap<u64, Trace>>,
    next_id: AtomicU64,
    listener: Option<Arc<dyn LeakListener>>,
    metrics: Arc<Metrics>,
}

impl LeakMonitor {
    pub fn new(config: LeakDetectionConfig, listener: Option<Arc<dyn LeakListener>>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            traces: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            listener,
            metrics,
        }
    }

    /// Record a new handle. Returns the trace id to untrack it with.
    pub fn track(&self, key: &Bytes, location: &'static Location<'static>, consumers: u32) -> Option<u64> {
        if !self.config.enabled {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.traces.lock().insert(
            id,
            Trace {
                key: key.clone(),
                location,
                consumers,
                since: Instant::now(),
                reported: false,
            },
        );
        if consumers > self.config.max_consumers {
            self.report(LeakReport {
                kind: LeakKind::TooManyConsumers,
                key: key.clone(),
                location,
                held_for: Duration::ZERO,
                consumers,
            });
        }
        Some(id)
    }

    pub fn untrack(&self, id: u64) {
        self.traces.lock().remove(&id);
    }

    /// Number of live tracked handles.
    pub fn outstanding(&self) -> usize {
        self.traces.lock().len()
    }

    /// Report every handle held too long that was not reported yet. Returns the number of new reports.
    pub fn scan(&self) -> usize {
        let now = Instant::now();
        let reports = {
            let mut traces = self.traces.lock();
            traces
                .values_mut()
                .filter(|trace| !trace.reported && now.duration_since(trace.since) > self.config.max_hold_time)
                .map(|trace| {
                    trace.reported = true;
                    LeakReport {
                        kind: LeakKind::HeldTooLong,
                        key: trace.key.clone(),
                        location: trace.location,
                        held_for: now.duration_since(trace.since),
                        consumers: trace.consumers,
                    }
                })
                .collect::<Vec<_>>()
        };
        let count = reports.len();
        for report in reports {
            self.report(report);
        }
        count
    }

    fn report(&self, report: LeakReport) {
        tracing::warn!("[leak]: suspected handle leak: {report}");
        match report.kind {
            LeakKind::HeldTooLong => self.metrics.leak_held_too_long.increase(1),
            LeakKind::TooManyConsumers => self.metrics.leak_too_many_consumers.increase(1),
        }
        if let Some(listener) = self.listener.as_ref() {
            listener.on_leak(&report);
        }
        if self.config.policy == LeakPolicy::Panic {
            panic!("suspected handle leak: {report}");
        }
    }

    /// Run [`LeakMonitor::scan`] every check interval until the monitor is dropped.
    pub fn spawn_scanner(self: &Arc<Self>, spawner: &Spawner) {
        if !self.config.enabled {
            return;
        }
        let monitor = Arc::downgrade(self);
        let interval = self.config.check_interval;
        let _ = spawner.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    tracing::debug!("[leak]: monitor dropped, scanner exits");
                    break;
                };
                monitor.scan();
            }
        });
    }
}
