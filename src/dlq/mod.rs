//! Dead-letter queue for messages whose processing failed terminally
//!
//! Every topic gets its own dead-letter stream named after it plus a configurable suffix. Entries
//! carry the failed message together with its failure history and can be inspected, re-published
//! to the original topic or deleted through the maintenance operations of [`DeadLetterQueue`].
//!
//! All operations accept either the topic or the name of its dead-letter stream, and either the
//! sequence token of the dead-letter entry or the identifier of the failed message.

mod message;

pub use message::*;

use crate::backend::{BackendError, SharedBackend};
use crate::config::DlqConfig;
use crate::envelope::{keys, DecodeError};
use crate::metrics::{MetricsEntry, SharedMetrics};
use crate::publisher::{PublishError, PublishReceipt, Publisher};
use chrono::Utc;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Number of entries fetched per page when searching by message identifier
const SCAN_PAGE_SIZE: usize = 100;

/// Errors of dead-letter queue operations
#[derive(Debug, Error)]
pub enum DlqError {
    /// No entry with the given identifier exists
    #[error("no dead letter '{id}' in '{stream}'")]
    NotFound {
        /// Dead-letter stream that was searched
        stream: String,
        /// Requested identifier
        id: String,
    },
    /// Entry could not be encoded
    #[error("unable to encode dead letter")]
    Encoding(#[from] serde_json::Error),
    /// Entry could not be decoded
    #[error("unable to decode dead letter")]
    Decode(#[from] DecodeError),
    /// Re-publishing to the original topic failed
    #[error("unable to re-publish dead letter")]
    Publish(#[from] PublishError),
    /// Backend failure
    #[error("backend operation failed")]
    Backend(#[from] BackendError),
    /// Some operations of a batch failed
    #[error("{} of {} operations failed: {}", .0.failed.len(), .0.total(), .0.failed_ids().join(", "))]
    Partial(BatchOutcome),
}

/// Result of a batch operation
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Identifiers processed successfully
    pub succeeded: Vec<String>,
    /// Identifiers that failed together with the reason
    pub failed: Vec<(String, DlqError)>,
}

impl BatchOutcome {
    /// Number of processed identifiers
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Identifiers that failed
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|(id, _)| id.as_str()).collect()
    }

    fn into_result(self) -> Result<Self, DlqError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(DlqError::Partial(self))
        }
    }
}

/// Manages the dead-letter streams of all topics
///
/// Safe for concurrent use by the automatic dead-letter middleware and maintenance tooling.
#[derive(Clone)]
pub struct DeadLetterQueue {
    backend: SharedBackend,
    publisher: Publisher,
    config: DlqConfig,
    metrics: SharedMetrics,
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.config)
            .finish()
    }
}

impl DeadLetterQueue {
    /// Creates a new instance re-publishing through the given publisher
    pub fn new(
        backend: SharedBackend,
        publisher: Publisher,
        config: DlqConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            backend,
            publisher,
            config,
            metrics,
        }
    }

    /// Settings of this queue
    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    /// Whether the name carries the dead-letter suffix.
    ///
    /// Such names always refer to a dead-letter stream, so a topic like `orders.dlq` can not
    /// have dead letters of its own.
    pub fn is_dead_letter_stream(&self, topic: &str) -> bool {
        topic.ends_with(&self.config.suffix)
    }

    /// Name of the dead-letter stream, accepting both the topic and the stream name itself
    pub fn stream(&self, topic: &str) -> String {
        if self.is_dead_letter_stream(topic) {
            topic.to_owned()
        } else {
            self.config.stream_for(topic)
        }
    }

    fn origin<'a>(&self, topic: &'a str) -> &'a str {
        topic.strip_suffix(&self.config.suffix).unwrap_or(topic)
    }

    /// Appends a failure record to the dead-letter stream of its topic, returning the entry id
    #[instrument(skip(self, message), fields(topic = %message.topic(), id = %message.message.id()))]
    pub async fn send(&self, message: DlqMessage) -> Result<String, DlqError> {
        let topic = message.topic().to_owned();
        let stream = self.stream(&topic);

        let id = self
            .backend
            .append(&stream, message.into_fields()?, self.config.max_length)
            .await?;

        debug!(dlq_id = %id, "Stored dead letter");
        self.refresh_backlog(&topic).await;

        Ok(id)
    }

    /// Dead letters of a topic in arrival order. Entries that cannot be decoded are skipped.
    pub async fn list(
        &self,
        topic: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DlqMessage>, DlqError> {
        let stream = self.stream(topic);
        let entries = self.backend.range(&stream, offset, limit).await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let id = entry.id.clone();
                DlqMessage::from_entry(entry)
                    .map_err(|e| {
                        warn!(%stream, dlq_id = %id, error = %e, "Skipping undecodable dead letter")
                    })
                    .ok()
            })
            .collect())
    }

    /// Single dead letter by entry or message identifier
    pub async fn get(&self, topic: &str, id: &str) -> Result<DlqMessage, DlqError> {
        let stream = self.stream(topic);

        if is_sequence(id) {
            if let Some(entry) = self.backend.get(&stream, id).await? {
                return Ok(DlqMessage::from_entry(entry)?);
            }
        }

        let mut offset = 0;
        loop {
            let page = self.backend.range(&stream, offset, SCAN_PAGE_SIZE).await?;
            let exhausted = page.len() < SCAN_PAGE_SIZE;

            for entry in page {
                if let Ok(message) = DlqMessage::from_entry(entry) {
                    if message.matches(id) {
                        return Ok(message);
                    }
                }
            }

            if exhausted {
                return Err(DlqError::NotFound {
                    stream,
                    id: id.to_owned(),
                });
            }

            offset += SCAN_PAGE_SIZE;
        }
    }

    /// Re-publishes a dead letter to its original topic and removes it from the queue
    ///
    /// The failure bookkeeping is stripped from the metadata and replaced by an audit trail.
    /// The entry is only deleted after the message has been published again, a failure in between
    /// leaves a duplicate rather than losing the message.
    #[instrument(skip(self))]
    pub async fn reprocess(&self, topic: &str, id: &str) -> Result<PublishReceipt, DlqError> {
        let stream = self.stream(topic);
        let dead_letter = self.get(&stream, id).await?;
        let dlq_id = dead_letter.dlq_id.clone().unwrap_or_default();

        let mut message = dead_letter.message;
        let metadata = message.metadata_mut();
        let reprocess_count = metadata
            .get(keys::REPROCESS_COUNT)
            .and_then(|count| count.parse::<u32>().ok())
            .unwrap_or_default();

        metadata.strip_retry_keys();
        metadata.set_timestamp(keys::REPROCESSED_AT, Utc::now());
        metadata.insert(keys::REPROCESSED_FROM, stream.clone());
        metadata.insert(keys::REPROCESS_COUNT, (reprocess_count + 1).to_string());

        let receipt = self.publisher.publish_message(message).await?;
        self.backend.delete(&stream, &[dlq_id.clone()]).await?;

        info!(dlq_id = %dlq_id, sequence = %receipt.sequence, "Reprocessed dead letter");
        self.refresh_backlog(self.origin(&stream)).await;

        Ok(receipt)
    }

    /// Reprocesses every identifier, continuing after failures
    pub async fn reprocess_batch(
        &self,
        topic: &str,
        ids: &[String],
    ) -> Result<BatchOutcome, DlqError> {
        let mut outcome = BatchOutcome::default();

        for id in ids {
            match self.reprocess(topic, id).await {
                Ok(_) => outcome.succeeded.push(id.clone()),
                Err(e) => outcome.failed.push((id.clone(), e)),
            }
        }

        outcome.into_result()
    }

    /// Removes a dead letter without re-publishing it
    #[instrument(skip(self))]
    pub async fn delete(&self, topic: &str, id: &str) -> Result<(), DlqError> {
        let stream = self.stream(topic);
        let dlq_id = self
            .get(&stream, id)
            .await?
            .dlq_id
            .unwrap_or_else(|| id.to_owned());

        if self.backend.delete(&stream, &[dlq_id]).await? == 0 {
            return Err(DlqError::NotFound {
                stream,
                id: id.to_owned(),
            });
        }

        self.refresh_backlog(self.origin(&stream)).await;

        Ok(())
    }

    /// Deletes every identifier, continuing after failures
    pub async fn delete_batch(
        &self,
        topic: &str,
        ids: &[String],
    ) -> Result<BatchOutcome, DlqError> {
        let mut outcome = BatchOutcome::default();

        for id in ids {
            match self.delete(topic, id).await {
                Ok(_) => outcome.succeeded.push(id.clone()),
                Err(e) => outcome.failed.push((id.clone(), e)),
            }
        }

        outcome.into_result()
    }

    /// Number of dead letters of a topic
    pub async fn count(&self, topic: &str) -> Result<usize, DlqError> {
        let stream = self.stream(topic);
        let count = self.backend.len(&stream).await?;

        self.metrics.record(MetricsEntry::DlqBacklog {
            topic: self.origin(&stream).to_owned(),
            size: count,
        });

        Ok(count)
    }

    /// Removes the whole dead-letter stream of a topic, returning the number of removed entries
    #[instrument(skip(self))]
    pub async fn purge(&self, topic: &str) -> Result<usize, DlqError> {
        let stream = self.stream(topic);
        let count = self.backend.len(&stream).await?;

        self.backend.remove(&stream).await?;
        info!(count, "Purged dead letters");

        self.metrics.record(MetricsEntry::DlqBacklog {
            topic: self.origin(&stream).to_owned(),
            size: 0,
        });

        Ok(count)
    }

    async fn refresh_backlog(&self, topic: &str) {
        match self.backend.len(&self.stream(topic)).await {
            Ok(size) => self.metrics.record(MetricsEntry::DlqBacklog {
                topic: topic.to_owned(),
                size,
            }),
            Err(e) => debug!(error = %e, "Unable to refresh dead-letter backlog"),
        }
    }
}

/// Whether the identifier looks like a backend sequence token rather than a message id
fn is_sequence(id: &str) -> bool {
    let mut parts = id.split('-');
    let numeric = |part: Option<&str>| {
        part.map(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    };

    numeric(parts.next()) && numeric(parts.next()) && parts.next().is_none()
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::backend::{MemoryBackend, StreamBackend};
    use crate::config::PublisherConfig;
    use crate::envelope::Message;
    use crate::handler::HandlerError;
    use crate::metrics::{InMemoryMetrics, MetricsSink};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const TOPIC: &str = "activity.created";
    const STREAM: &str = "activity.created.dlq";

    struct Fixture {
        dlq: DeadLetterQueue,
        backend: Arc<MemoryBackend>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn fixture_with(config: DlqConfig) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let publisher = Publisher::new(
            backend.clone(),
            PublisherConfig::default(),
            metrics.clone(),
        );
        let dlq = DeadLetterQueue::new(backend.clone(), publisher, config, metrics.clone());

        Fixture {
            dlq,
            backend,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DlqConfig::default())
    }

    fn dead_letter(payload: &str) -> DlqMessage {
        let mut message = Message::new(TOPIC, payload.to_owned());
        message
            .metadata_mut()
            .record_failure(3, "connection refused", Utc::now());

        DlqMessage::from_failure(
            &message,
            &HandlerError::transient("connection refused").with_attempts(3),
            Some("chat".into()),
        )
    }

    #[tokio::test]
    async fn list_in_arrival_order() {
        let f = fixture();
        for payload in ["a", "b", "c"] {
            f.dlq.send(dead_letter(payload)).await.unwrap();
        }

        let listed = f.dlq.list(TOPIC, 1, 10).await.unwrap();
        let payloads: Vec<&[u8]> = listed.iter().map(|m| m.message.payload()).collect();

        assert_eq!(payloads, vec![&b"b"[..], &b"c"[..]]);
        assert_eq!(f.dlq.list(STREAM, 0, 10).await.unwrap().len(), 3);
        assert_eq!(f.metrics.snapshot(TOPIC).unwrap().dlq_backlog, Some(3));
    }

    #[tokio::test]
    async fn find_by_either_identifier() {
        let f = fixture();
        let dead_letter = dead_letter("a");
        let message_id = dead_letter.message.id().to_owned();
        let dlq_id = f.dlq.send(dead_letter).await.unwrap();

        assert_eq!(f.dlq.get(TOPIC, &dlq_id).await.unwrap().message.id(), message_id);
        assert_eq!(
            f.dlq.get(TOPIC, &message_id).await.unwrap().dlq_id,
            Some(dlq_id)
        );
        assert!(matches!(
            f.dlq.get(TOPIC, "unknown").await,
            Err(DlqError::NotFound { .. })
        ));
        assert!(matches!(
            f.dlq.get(TOPIC, "999-0").await,
            Err(DlqError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reprocess_to_original_topic() {
        let f = fixture();
        let dlq_id = f.dlq.send(dead_letter("a")).await.unwrap();

        let receipt = f.dlq.reprocess(TOPIC, &dlq_id).await.unwrap();
        let republished = f.backend.get(TOPIC, &receipt.sequence).await.unwrap().unwrap();
        let message = crate::envelope::WireRecord::from_fields(&republished.fields)
            .unwrap()
            .into_message(TOPIC, None)
            .unwrap();
        let metadata = message.metadata();

        for key in keys::RETRY_KEYS.iter() {
            assert!(!metadata.contains_key(key), "{} survived", key);
        }
        assert_eq!(metadata.get(keys::REPROCESSED_FROM), Some(STREAM));
        assert_eq!(metadata.get(keys::REPROCESS_COUNT), Some("1"));
        assert!(metadata.timestamp(keys::REPROCESSED_AT).is_some());
        assert_eq!(f.dlq.count(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn report_partial_batches() {
        let f = fixture();
        let first = f.dlq.send(dead_letter("a")).await.unwrap();
        let second = f.dlq.send(dead_letter("b")).await.unwrap();

        let result = f
            .dlq
            .delete_batch(TOPIC, &[first.clone(), "missing".into(), second.clone()])
            .await;

        match result {
            Err(DlqError::Partial(outcome)) => {
                assert_eq!(outcome.succeeded, vec![first, second]);
                assert_eq!(outcome.failed_ids(), vec!["missing"]);
            }
            other => panic!("unexpected result {:?}", other),
        }

        assert_eq!(f.dlq.count(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reprocess_batches() {
        let f = fixture();
        let ids = vec![
            f.dlq.send(dead_letter("a")).await.unwrap(),
            f.dlq.send(dead_letter("b")).await.unwrap(),
        ];

        let outcome = f.dlq.reprocess_batch(TOPIC, &ids).await.unwrap();

        assert_eq!(outcome.succeeded, ids);
        assert_eq!(f.backend.len(TOPIC).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn purge_everything() {
        let f = fixture();
        for payload in ["a", "b"] {
            f.dlq.send(dead_letter(payload)).await.unwrap();
        }

        assert_eq!(f.dlq.purge(TOPIC).await.unwrap(), 2);
        assert_eq!(f.dlq.count(TOPIC).await.unwrap(), 0);
        assert_eq!(f.metrics.snapshot(TOPIC).unwrap().dlq_backlog, Some(0));
    }

    #[tokio::test]
    async fn retain_limited_history() {
        let f = fixture_with(DlqConfig {
            max_length: Some(2),
            ..Default::default()
        });

        for payload in ["a", "b", "c"] {
            f.dlq.send(dead_letter(payload)).await.unwrap();
        }

        assert_eq!(f.dlq.count(TOPIC).await.unwrap(), 2);
    }

    #[test]
    fn tell_sequences_from_message_ids() {
        assert!(is_sequence("1526919030474-55"));
        assert!(!is_sequence("6f1c9b8e-2f8a-4a8e-9a8e-3b9c8d7e6f5a"));
        assert!(!is_sequence("12-"));
        assert!(!is_sequence("1-2-3"));
    }
}
