//! In-memory collection of the `metrics` emitted during a run.
//!
//! [`InMemoryRecorder`] implements [`metrics::Recorder`]. Install it globally
//! (or with [`metrics::with_local_recorder`]) before the run and take a
//! [`MetricsSnapshot`] afterwards. Samples carrying a `node` label are also
//! broken down per node.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Label used for the per-node breakdown.
pub const NODE_LABEL: &str = "node";

// ============================================================================
// Snapshot Types
// ============================================================================

/// Metric values of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeMetrics {
    /// Counter values by metric name.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values by metric name.
    pub gauges: BTreeMap<String, f64>,
}

/// Every metric value at one point of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Wall clock time of the snapshot, RFC 3339.
    pub timestamp: String,
    /// Counters summed over all label sets.
    pub counters: BTreeMap<String, u64>,
    /// Gauges, last label set wins.
    pub gauges: BTreeMap<String, f64>,
    /// Breakdown by the `node` label.
    pub nodes: BTreeMap<String, NodeMetrics>,
}

impl MetricsSnapshot {
    /// Aggregated value of a counter, 0 when it was never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

// ============================================================================
// In-Memory Recorder
// ============================================================================

#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

impl CounterState {
    fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Stores the bits of an `f64`.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    fn increment(&self, value: f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .value
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
struct KeyMetadata {
    name: String,
    node: Option<String>,
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<String, Arc<GaugeState>>>,
    key_metadata: RwLock<BTreeMap<String, KeyMetadata>>,
}

/// `name|k=v,k=v` with labels in key order.
fn key_to_string(key: &Key) -> String {
    let mut labels: Vec<(&str, &str)> = key.labels().map(|l| (l.key(), l.value())).collect();
    if labels.is_empty() {
        return key.name().to_string();
    }
    labels.sort_unstable();
    let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}|{}", key.name(), labels.join(","))
}

fn key_metadata(key: &Key) -> KeyMetadata {
    KeyMetadata {
        name: key.name().to_string(),
        node: key
            .labels()
            .find(|l| l.key() == NODE_LABEL)
            .map(|l| l.value().to_string()),
    }
}

impl RecorderState {
    fn remember(&self, key_str: &str, key: &Key) {
        let mut metadata = self.key_metadata.write();
        metadata
            .entry(key_str.to_string())
            .or_insert_with(|| key_metadata(key));
    }

    fn get_or_create_counter(&self, key: &Key) -> Arc<CounterState> {
        let key_str = key_to_string(key);
        if let Some(counter) = self.counters.read().get(&key_str) {
            return counter.clone();
        }
        self.remember(&key_str, key);
        self.counters
            .write()
            .entry(key_str)
            .or_insert_with(|| Arc::new(CounterState::default()))
            .clone()
    }

    fn get_or_create_gauge(&self, key: &Key) -> Arc<GaugeState> {
        let key_str = key_to_string(key);
        if let Some(gauge) = self.gauges.read().get(&key_str) {
            return gauge.clone();
        }
        self.remember(&key_str, key);
        self.gauges
            .write()
            .entry(key_str)
            .or_insert_with(|| Arc::new(GaugeState::default()))
            .clone()
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let metadata = self.key_metadata.read();
        let mut snapshot = MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..MetricsSnapshot::default()
        };

        for (key_str, counter) in self.counters.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = counter.get();
            *snapshot.counters.entry(meta.name.clone()).or_insert(0) += value;
            if let Some(node) = &meta.node {
                let node_metrics = snapshot.nodes.entry(node.clone()).or_default();
                *node_metrics.counters.entry(meta.name.clone()).or_insert(0) += value;
            }
        }

        for (key_str, gauge) in self.gauges.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = gauge.get();
            snapshot.gauges.insert(meta.name.clone(), value);
            if let Some(node) = &meta.node {
                let node_metrics = snapshot.nodes.entry(node.clone()).or_default();
                node_metrics.gauges.insert(meta.name.clone(), value);
            }
        }

        snapshot
    }

    fn clear(&self) {
        for counter in self.counters.read().values() {
            counter.value.store(0, Ordering::Relaxed);
        }
        for gauge in self.gauges.read().values() {
            gauge.set(0.0);
        }
    }
}

/// Recorder keeping every counter and gauge in memory.
///
/// Clones share their state. Histograms are not collected.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of all current metric values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }

    /// Reset every value to zero, keeping the registered handles valid.
    pub fn clear(&self) {
        self.state.clear();
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.increment(value);
    }

    fn absolute(&self, value: u64) {
        self.state.value.fetch_max(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.increment(value);
    }

    fn decrement(&self, value: f64) {
        self.state.increment(-value);
    }

    fn set(&self, value: f64) {
        self.state.set(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = self.state.get_or_create_counter(key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = self.state.get_or_create_gauge(key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increment() {
        let recorder = InMemoryRecorder::new();
        let key = Key::from_static_name("test.counter");
        let counter = recorder.state.get_or_create_counter(&key);
        counter.increment(5);
        counter.increment(3);
        assert_eq!(counter.get(), 8);
    }

    #[test]
    fn test_gauge_increment_and_set() {
        let recorder = InMemoryRecorder::new();
        let key = Key::from_static_name("test.gauge");
        let gauge = recorder.state.get_or_create_gauge(&key);
        gauge.set(1.5);
        gauge.increment(0.5);
        gauge.increment(-1.0);
        assert_eq!(gauge.get(), 1.0);
    }

    #[test]
    fn test_key_to_string_sorts_labels() {
        let key = Key::from_parts(
            "ncsim.mac.grants",
            vec![
                metrics::Label::new("z", "1"),
                metrics::Label::new("node", "rrm"),
            ],
        );
        assert_eq!(key_to_string(&key), "ncsim.mac.grants|node=rrm,z=1");
        assert_eq!(key_to_string(&Key::from_static_name("plain")), "plain");
    }

    #[test]
    fn test_snapshot_breaks_down_by_node() {
        let recorder = InMemoryRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("ncsim.phy.tx_frames", "node" => "a").increment(2);
            metrics::counter!("ncsim.phy.tx_frames", "node" => "b").increment(3);
            metrics::counter!("ncsim.kernel.halted_entities").increment(1);
            metrics::gauge!("ncsim.control.reward", "node" => "gw").set(-0.25);
        });
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.counter("ncsim.phy.tx_frames"), 5);
        assert_eq!(snapshot.counter("ncsim.kernel.halted_entities"), 1);
        assert_eq!(snapshot.counter("ncsim.missing"), 0);
        assert_eq!(snapshot.nodes["a"].counters["ncsim.phy.tx_frames"], 2);
        assert_eq!(snapshot.nodes["b"].counters["ncsim.phy.tx_frames"], 3);
        assert_eq!(snapshot.gauges["ncsim.control.reward"], -0.25);
        assert!(!snapshot.nodes.contains_key(""));
    }

    #[test]
    fn test_clear_keeps_handles() {
        let recorder = InMemoryRecorder::new();
        let counter = recorder.register_counter(&Key::from_static_name("c"), &Metadata::new("t", metrics::Level::INFO, None));
        counter.increment(4);
        recorder.clear();
        assert_eq!(recorder.snapshot().counter("c"), 0);
        counter.increment(1);
        assert_eq!(recorder.snapshot().counter("c"), 1);
    }
}
