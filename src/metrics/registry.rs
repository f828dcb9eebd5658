use super::{MetricsEntry, MetricsSink, Outcome, LATENCY_HISTOGRAM_BUCKETS};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Success and failure tally
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    /// Number of successful operations
    pub success: u64,
    /// Number of failed operations
    pub failure: u64,
}

impl Counter {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Failure => self.failure += 1,
        }
    }

    /// Sum of both outcomes
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }
}

/// Cumulative latency histogram with fixed millisecond buckets
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    /// Number of observations below each bound of [`LATENCY_HISTOGRAM_BUCKETS`]
    pub buckets: Vec<u64>,
    /// Total number of observations
    pub count: u64,
    /// Sum of all observations in milliseconds
    pub sum_millis: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: vec![0; LATENCY_HISTOGRAM_BUCKETS.len()],
            count: 0,
            sum_millis: 0,
        }
    }
}

impl Histogram {
    fn observe(&mut self, latency: Duration) {
        let millis = latency.as_millis() as u64;

        for (bound, bucket) in LATENCY_HISTOGRAM_BUCKETS.iter().zip(self.buckets.iter_mut()) {
            if *bound > millis {
                *bucket += 1;
            }
        }

        self.count += 1;
        self.sum_millis += millis;
    }
}

/// Aggregates of a single topic
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMetrics {
    /// Publish outcomes
    pub published: Counter,
    /// Publish latency
    pub publish_latency: Histogram,
    /// Processing outcomes across all consumer groups
    pub processed: Counter,
    /// Processing latency
    pub process_latency: Histogram,
    /// Number of retried attempts
    pub retries: u64,
    /// Number of messages moved into the dead-letter queue
    pub dead_lettered: u64,
    /// Last reported size of the dead-letter queue
    pub dlq_backlog: Option<usize>,
}

/// In-process metrics registry
#[derive(Default)]
pub struct InMemoryMetrics {
    topics: Mutex<HashMap<String, TopicMetrics>>,
}

impl InMemoryMetrics {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics for which observations have been recorded
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .lock()
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default();

        topics.sort();
        topics
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, entry: MetricsEntry) {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };

        let metrics = topics.entry(entry.topic().to_owned()).or_default();

        match entry {
            MetricsEntry::Published {
                latency, outcome, ..
            } => {
                metrics.published.count(outcome);
                metrics.publish_latency.observe(latency);
            }
            MetricsEntry::Processed {
                latency, outcome, ..
            } => {
                metrics.processed.count(outcome);
                metrics.process_latency.observe(latency);
            }
            MetricsEntry::RetryAttempted { .. } => metrics.retries += 1,
            MetricsEntry::DeadLettered { .. } => metrics.dead_lettered += 1,
            MetricsEntry::DlqBacklog { size, .. } => metrics.dlq_backlog = Some(size),
        }
    }

    fn snapshot(&self, topic: &str) -> Option<TopicMetrics> {
        self.topics.lock().ok()?.get(topic).cloned()
    }
}
