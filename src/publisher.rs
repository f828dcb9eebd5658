//! Appending validated messages to topic streams

use crate::backend::{AppendRecord, BackendError, SharedBackend};
use crate::config::PublisherConfig;
use crate::envelope::{keys, validate, Message, ValidationError, WireRecord};
use crate::metrics::{MetricsEntry, Outcome, SharedMetrics};
use crate::telemetry::TraceContext;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Errors returned by publish operations
///
/// Nothing is ever retried internally, the caller decides how to react.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The message violates an invariant and has not been sent
    #[error("message {index} of the batch is invalid")]
    Validation {
        /// Position of the offending message, zero for single messages
        index: usize,
        /// Violated invariant
        #[source]
        source: ValidationError,
    },
    /// Metadata could not be encoded
    #[error("unable to encode message")]
    Encoding(#[from] serde_json::Error),
    /// The backend rejected or failed to perform the append.
    /// For batches, a prefix of the messages may have been appended already.
    #[error("backend failed to append")]
    Backend(#[from] BackendError),
}

impl PublishError {
    /// Whether the failure is caused by the message itself rather than the backend
    pub fn is_validation(&self) -> bool {
        matches!(self, PublishError::Validation { .. })
    }
}

/// Acknowledgement of a durable append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Identifier of the published message
    pub message_id: String,
    /// Sequence token assigned by the backend
    pub sequence: String,
}

/// Validates messages and appends them to the stream of their topic
///
/// There is no local buffering or de-duplication. Idempotency is the responsibility of the
/// payload design or the consumers.
#[derive(Clone)]
pub struct Publisher {
    backend: SharedBackend,
    config: PublisherConfig,
    metrics: SharedMetrics,
}

impl Publisher {
    /// Creates a new publisher appending to the given backend
    pub fn new(backend: SharedBackend, config: PublisherConfig, metrics: SharedMetrics) -> Self {
        Self {
            backend,
            config,
            metrics,
        }
    }

    /// Publishes an opaque payload to a topic
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish_message(Message::new(topic, payload)).await
    }

    /// Publishes a pre-built message, e.g. one carrying custom metadata or a natural identifier
    #[instrument(skip(self, message), fields(topic = %message.topic, id = %message.id))]
    pub async fn publish_message(&self, message: Message) -> Result<PublishReceipt, PublishError> {
        let start = Instant::now();
        let topic = message.topic.clone();

        let result = self.append(message).await;

        self.metrics.record(MetricsEntry::Published {
            topic,
            latency: start.elapsed(),
            outcome: Outcome::of(&result),
        });

        match &result {
            Ok(receipt) => debug!(sequence = %receipt.sequence, "Published message"),
            Err(e) if e.is_validation() => debug!(error = %e, "Rejected invalid message"),
            Err(e) => warn!(error = %e, "Failed to publish message"),
        }

        result
    }

    /// Publishes multiple messages in one round-trip
    ///
    /// Every message is validated before anything is appended, a single invalid message fails
    /// the whole batch without side effects. Once appending started, a backend error is reported
    /// but earlier messages may already be durable.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn publish_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<Vec<PublishReceipt>, PublishError> {
        let start = Instant::now();
        let mut ids = Vec::with_capacity(messages.len());
        let mut records = Vec::with_capacity(messages.len());

        for (index, message) in messages.into_iter().enumerate() {
            let message = self.prepare(message);
            validate(&message).map_err(|source| PublishError::Validation { index, source })?;

            ids.push((message.id.clone(), message.topic.clone()));
            records.push(AppendRecord {
                stream: message.topic.clone(),
                fields: WireRecord::from_message(&message)?.into_fields(),
            });
        }

        let result = self
            .backend
            .append_batch(records, self.config.max_stream_length)
            .await;

        let latency = start.elapsed();
        for (_, topic) in ids.iter() {
            self.metrics.record(MetricsEntry::Published {
                topic: topic.clone(),
                latency,
                outcome: Outcome::of(&result),
            });
        }

        let sequences = result.map_err(|e| {
            warn!(error = %e, "Failed to publish batch");
            e
        })?;

        debug!("Published batch");

        Ok(ids
            .into_iter()
            .zip(sequences)
            .map(|((message_id, _), sequence)| PublishReceipt {
                message_id,
                sequence,
            })
            .collect())
    }

    async fn append(&self, message: Message) -> Result<PublishReceipt, PublishError> {
        let message = self.prepare(message);
        validate(&message).map_err(|source| PublishError::Validation { index: 0, source })?;

        let record = WireRecord::from_message(&message)?;
        let sequence = self
            .backend
            .append(
                &message.topic,
                record.into_fields(),
                self.config.max_stream_length,
            )
            .await?;

        Ok(PublishReceipt {
            message_id: message.id,
            sequence,
        })
    }

    /// Fills in everything the runtime is responsible for
    fn prepare(&self, mut message: Message) -> Message {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }

        TraceContext::current().inject(&mut message.metadata);

        if let Some(service) = &self.config.service_name {
            message
                .metadata
                .insert(keys::SOURCE_SERVICE, service.clone());
        }

        if let Some(content_type) = &self.config.content_type {
            if !message.metadata.contains_key(keys::CONTENT_TYPE) {
                message
                    .metadata
                    .insert(keys::CONTENT_TYPE, content_type.clone());
            }
        }

        message
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::backend::{MemoryBackend, StreamBackend};
    use crate::envelope::MAX_PAYLOAD_SIZE;
    use crate::metrics::{InMemoryMetrics, MetricsSink};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const TOPIC: &str = "activity.created";

    fn publisher_with(config: PublisherConfig) -> (Publisher, Arc<MemoryBackend>, Arc<InMemoryMetrics>) {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let publisher = Publisher::new(backend.clone(), config, metrics.clone());

        (publisher, backend, metrics)
    }

    fn publisher() -> (Publisher, Arc<MemoryBackend>, Arc<InMemoryMetrics>) {
        publisher_with(PublisherConfig::default())
    }

    async fn stored(backend: &MemoryBackend) -> Vec<Message> {
        backend
            .range(TOPIC, 0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| {
                WireRecord::from_fields(&entry.fields)
                    .unwrap()
                    .into_message(TOPIC, Some(entry.id))
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn append_to_topic_stream() {
        let (publisher, backend, metrics) = publisher();

        let receipt = publisher.publish(TOPIC, "hello").await.unwrap();
        let messages = stored(&backend).await;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id(), receipt.message_id);
        assert_eq!(messages[0].sequence(), Some(receipt.sequence.as_str()));
        assert_eq!(messages[0].payload(), b"hello");
        assert_eq!(metrics.snapshot(TOPIC).unwrap().published.success, 1);
    }

    #[tokio::test]
    async fn inject_runtime_metadata() {
        let (publisher, backend, _) = publisher_with(PublisherConfig {
            service_name: Some("activity".into()),
            content_type: Some("application/json".into()),
            ..Default::default()
        });

        let message = Message::new(TOPIC, "{}").with_metadata(keys::CONTENT_TYPE, "text/plain");
        publisher.publish_message(message).await.unwrap();

        let metadata = stored(&backend).await.remove(0).metadata;
        assert_eq!(metadata.get(keys::SOURCE_SERVICE), Some("activity"));
        assert_eq!(metadata.get(keys::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(metadata.get(keys::TRACE_ID).map(str::len), Some(32));
        assert_eq!(metadata.get(keys::SPAN_ID).map(str::len), Some(16));
    }

    #[tokio::test]
    async fn assign_missing_identifiers() {
        let (publisher, _, _) = publisher();
        let receipt = publisher
            .publish_message(Message::new(TOPIC, "x").with_id(""))
            .await
            .unwrap();

        assert!(!receipt.message_id.is_empty());
    }

    #[tokio::test]
    async fn reject_invalid_messages_without_appending() {
        let (publisher, backend, metrics) = publisher();

        for (topic, payload) in [
            ("Invalid Topic", vec![1]),
            ("ab", vec![1]),
            (TOPIC, Vec::new()),
            (TOPIC, vec![0; MAX_PAYLOAD_SIZE + 1]),
        ] {
            let result = publisher.publish(topic, payload).await;
            assert!(matches!(result, Err(PublishError::Validation { .. })));
        }

        assert_eq!(backend.len(TOPIC).await.unwrap(), 0);
        assert_eq!(metrics.snapshot(TOPIC).unwrap().published.failure, 2);
    }

    #[tokio::test]
    async fn validate_whole_batch_first() {
        let (publisher, backend, _) = publisher();

        let result = publisher
            .publish_batch(vec![
                Message::new(TOPIC, "a"),
                Message::new(TOPIC, "b"),
                Message::new(TOPIC, ""),
            ])
            .await;

        assert!(matches!(
            result,
            Err(PublishError::Validation { index: 2, .. })
        ));
        assert_eq!(backend.len(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn publish_batches_in_order() {
        let (publisher, backend, _) = publisher();

        let receipts = publisher
            .publish_batch(vec![
                Message::new(TOPIC, "a"),
                Message::new(TOPIC, "b"),
                Message::new("user.joined", "c"),
            ])
            .await
            .unwrap();

        let payloads: Vec<Vec<u8>> = stored(&backend)
            .await
            .into_iter()
            .map(Message::into_payload)
            .collect();

        assert_eq!(receipts.len(), 3);
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(backend.len("user.joined").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cap_stream_length() {
        let (publisher, backend, _) = publisher_with(PublisherConfig {
            max_stream_length: Some(2),
            ..Default::default()
        });

        for payload in ["a", "b", "c"] {
            publisher.publish(TOPIC, payload).await.unwrap();
        }

        assert_eq!(backend.len(TOPIC).await.unwrap(), 2);
    }
}
