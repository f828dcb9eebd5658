//! Publish and process observations
//!
//! Components submit [`MetricsEntry`] values to a [`MetricsSink`]. Two sinks exist: the
//! [`InMemoryMetrics`] registry which aggregates per topic and can be inspected at runtime, and
//! the [`RedisMetricsProcessor`] which persists the same aggregates into Redis hashes so that
//! external tooling can scrape them.

mod entry;
mod processor;
mod registry;

pub use entry::*;
pub use processor::*;
pub use registry::*;

use std::sync::Arc;

/// Upper bounds in milliseconds of the latency histogram buckets
pub static LATENCY_HISTOGRAM_BUCKETS: [u64; 16] = [
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000, 60000, 120000,
];

/// Receiver of metrics observations
///
/// Recording must never block or fail the operation being measured.
pub trait MetricsSink: Send + Sync {
    /// Records a single observation
    fn record(&self, entry: MetricsEntry);

    /// Aggregated values for a topic, if the sink keeps them in memory
    fn snapshot(&self, _topic: &str) -> Option<TopicMetrics> {
        None
    }
}

/// Dynamic dispatch version of [`MetricsSink`]
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Sink forwarding every observation to multiple other sinks
pub struct MetricsFanout {
    sinks: Vec<SharedMetrics>,
}

impl MetricsFanout {
    /// Creates a new fanout, snapshots are served by the first sink that provides one
    pub fn new(sinks: Vec<SharedMetrics>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for MetricsFanout {
    fn record(&self, entry: MetricsEntry) {
        for sink in self.sinks.iter() {
            sink.record(entry.clone());
        }
    }

    fn snapshot(&self, topic: &str) -> Option<TopicMetrics> {
        self.sinks.iter().find_map(|sink| sink.snapshot(topic))
    }
}
