use crate::handler::ErrorKind;
use std::time::Duration;
use std::{fmt, fmt::Display};

/// Result of a measured operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Operation completed
    Success,
    /// Operation failed
    Failure,
}

impl Outcome {
    /// Maps a result onto its outcome
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

/// Single observation submitted to a [`MetricsSink`](super::MetricsSink)
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsEntry {
    /// A message has been appended (or failed to be)
    Published {
        /// Target topic
        topic: String,
        /// Time spent in the publish call
        latency: Duration,
        /// Whether the append succeeded
        outcome: Outcome,
    },
    /// A delivery ran through the handler chain
    Processed {
        /// Source topic
        topic: String,
        /// Consumer group processing the message
        group: String,
        /// Time spent in the handler chain
        latency: Duration,
        /// Whether processing succeeded
        outcome: Outcome,
    },
    /// A failed attempt is about to be retried
    RetryAttempted {
        /// Source topic
        topic: String,
        /// Attempt that failed (1-based)
        attempt: u32,
    },
    /// A message has been moved into the dead-letter queue
    DeadLettered {
        /// Original topic
        topic: String,
        /// Classification of the terminal failure
        kind: ErrorKind,
    },
    /// Current number of entries in the dead-letter queue of a topic
    DlqBacklog {
        /// Original topic
        topic: String,
        /// Number of dead letters
        size: usize,
    },
}

impl MetricsEntry {
    /// Topic the observation belongs to
    pub fn topic(&self) -> &str {
        match self {
            MetricsEntry::Published { topic, .. }
            | MetricsEntry::Processed { topic, .. }
            | MetricsEntry::RetryAttempted { topic, .. }
            | MetricsEntry::DeadLettered { topic, .. }
            | MetricsEntry::DlqBacklog { topic, .. } => topic,
        }
    }
}
