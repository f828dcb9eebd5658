use super::Middleware;
use crate::dlq::{DeadLetterQueue, DlqMessage};
use crate::envelope::Message;
use crate::handler::{BoxedHandler, Handler, HandlerResult};
use crate::metrics::{MetricsEntry, SharedMetrics};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Moves messages whose processing failed terminally into the dead-letter queue
///
/// A message that has been stored successfully counts as handled and is acknowledged. If the
/// dead-letter stream cannot be written, the original error is passed on and the entry stays
/// pending so that it is delivered again later.
#[derive(Clone)]
pub struct DeadLetterMiddleware {
    dlq: DeadLetterQueue,
    group: String,
    metrics: SharedMetrics,
}

impl DeadLetterMiddleware {
    /// Creates a new instance recording the given consumer group as the failing party
    pub fn new(dlq: DeadLetterQueue, group: impl Into<String>, metrics: SharedMetrics) -> Self {
        Self {
            dlq,
            group: group.into(),
            metrics,
        }
    }
}

impl Middleware for DeadLetterMiddleware {
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        Arc::new(DeadLetterHandler {
            inner,
            layer: self.clone(),
        })
    }
}

struct DeadLetterHandler {
    inner: BoxedHandler,
    layer: DeadLetterMiddleware,
}

#[async_trait]
impl Handler for DeadLetterHandler {
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        let error = match self.inner.handle(message).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let kind = error.kind();
        let dead_letter = DlqMessage::from_failure(message, &error, Some(self.layer.group.clone()));

        match self.layer.dlq.send(dead_letter).await {
            Ok(dlq_id) => {
                warn!(
                    id = %message.id(),
                    %dlq_id,
                    %kind,
                    attempts = error.attempts(),
                    error = %error.chain().compact(),
                    "Moved message into dead-letter queue"
                );

                self.layer.metrics.record(MetricsEntry::DeadLettered {
                    topic: message.topic().to_owned(),
                    kind,
                });

                Ok(())
            }
            Err(e) => {
                error!(id = %message.id(), error = %e, "Unable to store dead letter, leaving message pending");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::backend::{MemoryBackend, SharedBackend, StreamBackend};
    use crate::config::{DlqConfig, PublisherConfig};
    use crate::handler::{handler_fn, ErrorKind, HandlerError};
    use crate::metrics::{InMemoryMetrics, MetricsSink};
    use crate::publisher::Publisher;
    use pretty_assertions::assert_eq;

    const TOPIC: &str = "activity.created";
    const GROUP: &str = "notifications";

    fn setup() -> (DeadLetterQueue, Arc<MemoryBackend>, Arc<InMemoryMetrics>) {
        let memory = Arc::new(MemoryBackend::new());
        let backend: SharedBackend = memory.clone();
        let metrics = Arc::new(InMemoryMetrics::new());
        let publisher = Publisher::new(
            backend.clone(),
            PublisherConfig::default(),
            metrics.clone(),
        );
        let dlq = DeadLetterQueue::new(backend, publisher, DlqConfig::default(), metrics.clone());

        (dlq, memory, metrics)
    }

    fn failing(error: fn() -> HandlerError) -> BoxedHandler {
        Arc::new(handler_fn(move |_: Message| async move { Err::<(), _>(error()) }))
    }

    #[tokio::test]
    async fn store_terminal_failures() {
        let (dlq, _, metrics) = setup();
        let handler = DeadLetterMiddleware::new(dlq.clone(), GROUP, metrics.clone())
            .wrap(failing(|| HandlerError::permanent("malformed")));

        let mut message = Message::new(TOPIC, "x");
        handler.handle(&mut message).await.unwrap();

        let stored = dlq.list(TOPIC, 0, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message.id(), message.id());
        assert_eq!(stored[0].failure_kind, ErrorKind::Permanent);
        assert_eq!(stored[0].failure_count, 1);
        assert_eq!(stored[0].consumer_group.as_deref(), Some(GROUP));

        let snapshot = metrics.snapshot(TOPIC).unwrap();
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.dlq_backlog, Some(1));
    }

    #[tokio::test]
    async fn pass_successes_through() {
        let (dlq, _, metrics) = setup();
        let handler = DeadLetterMiddleware::new(dlq.clone(), GROUP, metrics)
            .wrap(Arc::new(handler_fn(|_: Message| async { Ok::<_, HandlerError>(()) })));

        handler.handle(&mut Message::new(TOPIC, "x")).await.unwrap();

        assert_eq!(dlq.count(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn keep_error_when_storing_fails() {
        let (dlq, backend, metrics) = setup();
        let handler = DeadLetterMiddleware::new(dlq, GROUP, metrics)
            .wrap(failing(|| HandlerError::transient("down")));

        backend.close().await.unwrap();
        let error = handler
            .handle(&mut Message::new(TOPIC, "x"))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Transient);
    }
}
