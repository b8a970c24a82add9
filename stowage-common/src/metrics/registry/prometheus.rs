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

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use itertools::Itertools;
use parking_lot::Mutex;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::{
    metrics::{
        registry::noop::NoopMetricsRegistry, BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, BoxedHistogram,
        BoxedHistogramVec, Boxer, CounterOps, CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps,
        RegistryOps,
    },
    scope::Scope,
};

#[derive(Debug, Clone)]
enum MetricVec {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
    Histogram(HistogramVec),
}

impl CounterOps for IntCounter {
    fn increase(&self, val: u64) {
        self.inc_by(val);
    }
}

impl CounterVecOps for IntCounterVec {
    fn counter(&self, labels: &[Cow<'static, str>]) -> BoxedCounter {
        let labels = labels.iter().map(Cow::as_ref).collect_vec();
        self.with_label_values(&labels).boxed()
    }
}

impl GaugeOps for IntGauge {
    fn increase(&self, val: u64) {
        self.add(val as _);
    }

    fn decrease(&self, val: u64) {
        self.sub(val as _);
    }

    fn absolute(&self, val: u64) {
        self.set(val as _);
    }
}

impl GaugeVecOps for IntGaugeVec {
    fn gauge(&self, labels: &[Cow<'static, str>]) -> BoxedGauge {
        let labels = labels.iter().map(Cow::as_ref).collect_vec();
        self.with_label_values(&labels).boxed()
    }
}

impl HistogramOps for Histogram {
    fn record(&self, val: f64) {
        self.observe(val);
    }
}

impl HistogramVecOps for HistogramVec {
    fn histogram(&self, labels: &[Cow<'static, str>]) -> BoxedHistogram {
        let labels = labels.iter().map(Cow::as_ref).collect_vec();
        self.with_label_values(&labels).boxed()
    }
}

/// Prometheus metric registry with lib `prometheus`.
///
/// The [`PrometheusMetricsRegistry`] can be cloned and shared by multiple caches. Each metric vector is registered
/// once per registry and reused afterwards, so caches are told apart by their `name` label.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsRegistry {
    registry: Registry,
    vecs: Arc<Mutex<HashMap<&'static str, MetricVec>>>,
}

impl PrometheusMetricsRegistry {
    /// Create an Prometheus metrics registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            vecs: Arc::default(),
        }
    }

    /// The wrapped prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn get_or_register(
        &self,
        name: &'static str,
        create: impl FnOnce() -> prometheus::Result<MetricVec>,
    ) -> Option<MetricVec> {
        self.vecs.lock().with(|mut vecs| {
            if let Some(vec) = vecs.get(name) {
                return Some(vec.clone());
            }
            let vec = create()
                .and_then(|vec| {
                    let collector: Box<dyn prometheus::core::Collector> = match &vec {
                        MetricVec::Counter(v) => Box::new(v.clone()),
                        MetricVec::Gauge(v) => Box::new(v.clone()),
                        MetricVec::Histogram(v) => Box::new(v.clone()),
                    };
                    self.registry.register(collector).map(|_| vec)
                })
                .inspect_err(|e| tracing::warn!("[metrics]: failed to register metric {name}: {e}"))
                .ok()?;
            vecs.insert(name, vec.clone());
            Some(vec)
        })
    }
}

impl RegistryOps for PrometheusMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedCounterVec {
        match self.get_or_register(name, || {
            IntCounterVec::new(Opts::new(name, desc), label_names).map(MetricVec::Counter)
        }) {
            Some(MetricVec::Counter(v)) => v.boxed(),
            _ => NoopMetricsRegistry.boxed(),
        }
    }

    fn register_gauge_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedGaugeVec {
        match self.get_or_register(name, || {
            IntGaugeVec::new(Opts::new(name, desc), label_names).map(MetricVec::Gauge)
        }) {
            Some(MetricVec::Gauge(v)) => v.boxed(),
            _ => NoopMetricsRegistry.boxed(),
        }
    }

    fn register_histogram_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedHistogramVec {
        match self.get_or_register(name, || {
            HistogramVec::new(HistogramOpts::new(name, desc), label_names).map(MetricVec::Histogram)
        }) {
            Some(MetricVec::Histogram(v)) => v.boxed(),
            _ => NoopMetricsRegistry.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use prometheus::{Encoder, TextEncoder};

    use super::*;

    fn case(registry: &PrometheusMetricsRegistry) {
        let cv = registry.register_counter_vec("test_counter_1", "test counter 1", &["label1", "label2"]);
        let c = cv.counter(&["l1".into(), "l2".into()]);
        c.increase(42);

        let gv = registry.register_gauge_vec("test_gauge_1", "test gauge 1", &["label1", "label2"]);
        let g = gv.gauge(&["l1".into(), "l2".into()]);
        g.increase(514);
        g.decrease(114);
        g.absolute(114514);

        let hv = registry.register_histogram_vec("test_histogram_1", "test histogram 1", &["label1", "label2"]);
        let h = hv.histogram(&["l1".into(), "l2".into()]);
        h.record(114.514);
    }

    #[test]
    fn test_prometheus_metrics_registry() {
        let p8s = PrometheusMetricsRegistry::new(Registry::new());
        case(&p8s);
        let families = p8s.registry().gather();
        assert_eq!(families.len(), 3);
    }

    #[test]
    fn test_shared_prometheus_metrics_registry() {
        let p8s1 = PrometheusMetricsRegistry::new(Registry::new());
        let p8s2 = p8s1.clone();
        case(&p8s1);
        case(&p8s2);
        let mut buf = vec![];
        TextEncoder::new().encode(&p8s1.registry().gather(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#"test_counter_1{label1="l1",label2="l2"} 84"#), "{text}");
    }

    #[test]
    fn test_conflicting_registration_falls_back_to_noop() {
        let registry = Registry::new();
        let p8s1 = PrometheusMetricsRegistry::new(registry.clone());
        let p8s2 = PrometheusMetricsRegistry::new(registry);
        case(&p8s1);
        // The second wrapper does not know about the first one, registration conflicts and is skipped.
        case(&p8s2);
        assert_eq!(p8s1.registry().gather().len(), 3);
    }
}
