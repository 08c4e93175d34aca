//! Metrics instrumentation seams.
//!
//! The runtime never talks to an exporter. It asks a [`Metrics`]
//! implementation for pre-bound [`Counter`], [`Gauge`], and [`Histogram`]
//! handles once, at registration time, and drives those handles from the hot
//! path. The default [`NoopMetrics`] hands out disabled handles whose use
//! costs one branch and no allocation. [`InMemoryMetrics`] aggregates
//! in-process, for tests and introspection.
//!
//! Metric names and label keys are stable; see [`names`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::scheduling::Band;

/// Stable metric names emitted by the runtime.
pub mod names {
    /// Messages delivered to a node, labelled `{node}`.
    pub const NODE_MESSAGES_TOTAL: &str = "node_messages_total";
    /// Hook errors reported by a node, labelled `{node}`.
    pub const NODE_ERRORS_TOTAL: &str = "node_errors_total";
    /// Histogram of `on_tick` durations in seconds, labelled `{node}`.
    pub const NODE_TICK_DURATION_SECONDS: &str = "node_tick_duration_seconds";
    /// Items accepted by an edge, labelled `{edge_id}`.
    pub const EDGE_ENQUEUED_TOTAL: &str = "edge_enqueued_total";
    /// Items dequeued from an edge, labelled `{edge_id}`.
    pub const EDGE_DEQUEUED_TOTAL: &str = "edge_dequeued_total";
    /// Items discarded by an edge, labelled `{edge_id}`.
    pub const EDGE_DROPPED_TOTAL: &str = "edge_dropped_total";
    /// Current depth of an edge, labelled `{edge_id}`.
    pub const EDGE_QUEUE_DEPTH: &str = "edge_queue_depth";
    /// Histogram of blocked intervals in seconds, labelled `{edge_id}`.
    pub const EDGE_BLOCKED_TIME_SECONDS: &str = "edge_blocked_time_seconds";
    /// Nodes ready to run, labelled `{band}`.
    pub const SCHEDULER_RUNNABLE_NODES: &str = "scheduler_runnable_nodes";
    /// Histogram of loop iteration latency in seconds.
    pub const SCHEDULER_LOOP_LATENCY_SECONDS: &str = "scheduler_loop_latency_seconds";
    /// Priority mutations applied, labelled `{band}`.
    pub const SCHEDULER_PRIORITY_APPLIED_TOTAL: &str = "scheduler_priority_applied_total";
}

/// Label pairs bound into a handle at creation time. Cardinality stays low:
/// labels are node names, edge ids, and band names only.
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// A factory for pre-bound metric handles.
///
/// Implementations must hand out handles that are cheap to drive; the
/// runtime calls them once per message on hot paths.
pub trait Metrics {
    /// A monotonically increasing counter.
    fn counter(&self, name: &'static str, labels: Labels<'_>) -> Counter;
    /// A gauge holding the latest observed value.
    fn gauge(&self, name: &'static str, labels: Labels<'_>) -> Gauge;
    /// A histogram of observed values.
    fn histogram(&self, name: &'static str, labels: Labels<'_>) -> Histogram;
}

/// A pre-bound counter handle. Disabled handles do nothing.
#[derive(Clone, Default)]
pub struct Counter {
    sink: Option<Arc<dyn Fn(u64)>>,
}

impl Counter {
    /// A handle that discards increments.
    pub fn disabled() -> Self {
        Counter { sink: None }
    }

    /// A handle driving the given sink.
    pub fn from_fn(sink: impl Fn(u64) + 'static) -> Self {
        Counter {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Increments by one.
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Increments by `n`.
    #[inline]
    pub fn add(&self, n: u64) {
        if let Some(sink) = &self.sink {
            sink(n);
        }
    }
}

/// A pre-bound gauge handle. Disabled handles do nothing.
#[derive(Clone, Default)]
pub struct Gauge {
    sink: Option<Arc<dyn Fn(f64)>>,
}

impl Gauge {
    /// A handle that discards observations.
    pub fn disabled() -> Self {
        Gauge { sink: None }
    }

    /// A handle driving the given sink.
    pub fn from_fn(sink: impl Fn(f64) + 'static) -> Self {
        Gauge {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Records the current value.
    #[inline]
    pub fn set(&self, value: f64) {
        if let Some(sink) = &self.sink {
            sink(value);
        }
    }
}

/// A pre-bound histogram handle. Disabled handles do nothing.
#[derive(Clone, Default)]
pub struct Histogram {
    sink: Option<Arc<dyn Fn(f64)>>,
}

impl Histogram {
    /// A handle that discards observations.
    pub fn disabled() -> Self {
        Histogram { sink: None }
    }

    /// A handle driving the given sink.
    pub fn from_fn(sink: impl Fn(f64) + 'static) -> Self {
        Histogram {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Records one observation.
    #[inline]
    pub fn observe(&self, value: f64) {
        if let Some(sink) = &self.sink {
            sink(value);
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({})", if self.sink.is_some() { "bound" } else { "disabled" })
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gauge({})", if self.sink.is_some() { "bound" } else { "disabled" })
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Histogram({})", if self.sink.is_some() { "bound" } else { "disabled" })
    }
}

/// The default metrics implementation: every handle is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn counter(&self, _name: &'static str, _labels: Labels<'_>) -> Counter {
        Counter::disabled()
    }
    fn gauge(&self, _name: &'static str, _labels: Labels<'_>) -> Gauge {
        Gauge::disabled()
    }
    fn histogram(&self, _name: &'static str, _labels: Labels<'_>) -> Histogram {
        Histogram::disabled()
    }
}

/// In-process metric aggregation, keyed by `name{label=value,...}`.
///
/// Cloning shares the underlying store, so a clone kept by a test observes
/// everything the scheduler records.
#[derive(Clone, Default)]
pub struct InMemoryMetrics {
    store: Arc<Store>,
}

#[derive(Default)]
struct Store {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    let mut key = String::with_capacity(name.len() + 16);
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key.push('}');
    key
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryMetrics {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series, zero when absent.
    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        lock(&self.store.counters)
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Latest value of a gauge series.
    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        lock(&self.store.gauges).get(&series_key(name, labels)).copied()
    }

    /// All observations of a histogram series, in record order.
    pub fn histogram_values(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        lock(&self.store.histograms)
            .get(&series_key(name, labels))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every counter series.
    pub fn counters(&self) -> HashMap<String, u64> {
        lock(&self.store.counters).clone()
    }
}

impl Metrics for InMemoryMetrics {
    fn counter(&self, name: &'static str, labels: Labels<'_>) -> Counter {
        let store = Arc::clone(&self.store);
        let key = series_key(name, labels);
        Counter::from_fn(move |n| {
            *lock(&store.counters).entry(key.clone()).or_insert(0) += n;
        })
    }

    fn gauge(&self, name: &'static str, labels: Labels<'_>) -> Gauge {
        let store = Arc::clone(&self.store);
        let key = series_key(name, labels);
        Gauge::from_fn(move |v| {
            lock(&store.gauges).insert(key.clone(), v);
        })
    }

    fn histogram(&self, name: &'static str, labels: Labels<'_>) -> Histogram {
        let store = Arc::clone(&self.store);
        let key = series_key(name, labels);
        Histogram::from_fn(move |v| {
            lock(&store.histograms).entry(key.clone()).or_default().push(v);
        })
    }
}

impl fmt::Debug for InMemoryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetrics").finish_non_exhaustive()
    }
}

/// Handles for one edge, bound once at registration.
#[derive(Clone, Default)]
pub(crate) struct EdgeMetrics {
    pub enqueued: Counter,
    pub dequeued: Counter,
    pub dropped: Counter,
    pub depth: Gauge,
    pub blocked_time: Histogram,
}

impl EdgeMetrics {
    pub fn bind(metrics: &dyn Metrics, edge_id: &str) -> Self {
        let labels: &[(&'static str, &str)] = &[("edge_id", edge_id)];
        EdgeMetrics {
            enqueued: metrics.counter(names::EDGE_ENQUEUED_TOTAL, labels),
            dequeued: metrics.counter(names::EDGE_DEQUEUED_TOTAL, labels),
            dropped: metrics.counter(names::EDGE_DROPPED_TOTAL, labels),
            depth: metrics.gauge(names::EDGE_QUEUE_DEPTH, labels),
            blocked_time: metrics.histogram(names::EDGE_BLOCKED_TIME_SECONDS, labels),
        }
    }
}

/// Handles for one node, bound once at registration.
#[derive(Clone, Default)]
pub(crate) struct NodeMetrics {
    pub messages: Counter,
    pub errors: Counter,
    pub tick_duration: Histogram,
}

impl NodeMetrics {
    pub fn bind(metrics: &dyn Metrics, node: &str) -> Self {
        let labels: &[(&'static str, &str)] = &[("node", node)];
        NodeMetrics {
            messages: metrics.counter(names::NODE_MESSAGES_TOTAL, labels),
            errors: metrics.counter(names::NODE_ERRORS_TOTAL, labels),
            tick_duration: metrics.histogram(names::NODE_TICK_DURATION_SECONDS, labels),
        }
    }
}

/// Handles for the scheduler itself, bound once at startup.
#[derive(Clone, Default)]
pub(crate) struct SchedulerMetrics {
    pub runnable: [Gauge; 3],
    pub loop_latency: Histogram,
    pub priority_applied: [Counter; 3],
}

impl SchedulerMetrics {
    pub fn bind(metrics: &dyn Metrics) -> Self {
        let per_band_gauge = |band: Band| {
            metrics.gauge(names::SCHEDULER_RUNNABLE_NODES, &[("band", band.as_str())])
        };
        let per_band_counter = |band: Band| {
            metrics.counter(
                names::SCHEDULER_PRIORITY_APPLIED_TOTAL,
                &[("band", band.as_str())],
            )
        };
        SchedulerMetrics {
            runnable: [
                per_band_gauge(Band::Control),
                per_band_gauge(Band::High),
                per_band_gauge(Band::Normal),
            ],
            loop_latency: metrics.histogram(names::SCHEDULER_LOOP_LATENCY_SECONDS, &[]),
            priority_applied: [
                per_band_counter(Band::Control),
                per_band_counter(Band::High),
                per_band_counter(Band::Normal),
            ],
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn in_memory_counter_accumulates() {
        let metrics = InMemoryMetrics::new();
        let c = metrics.counter(names::EDGE_ENQUEUED_TOTAL, &[("edge_id", "a:out->b:in")]);
        c.inc();
        c.add(4);
        assert_eq!(
            metrics.counter_value(names::EDGE_ENQUEUED_TOTAL, &[("edge_id", "a:out->b:in")]),
            5
        );
        // A different label set is a different series.
        assert_eq!(
            metrics.counter_value(names::EDGE_ENQUEUED_TOTAL, &[("edge_id", "other")]),
            0
        );
    }

    #[test]
    fn in_memory_gauge_keeps_latest() {
        let metrics = InMemoryMetrics::new();
        let g = metrics.gauge(names::EDGE_QUEUE_DEPTH, &[("edge_id", "e")]);
        g.set(3.0);
        g.set(1.0);
        assert_eq!(metrics.gauge_value(names::EDGE_QUEUE_DEPTH, &[("edge_id", "e")]), Some(1.0));
    }

    #[test]
    fn disabled_handles_do_nothing() {
        Counter::disabled().inc();
        Gauge::disabled().set(1.0);
        Histogram::disabled().observe(1.0);
    }
}
