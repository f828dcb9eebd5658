//! Façade wiring backend, publisher, subscriber and dead-letter queue together

use crate::backend::{BackendError, BackendExt, RedisBackend, SharedBackend};
use crate::config::{ClientConfig, ConfigError, ConsumerConfig, RetryPolicy};
use crate::dlq::DeadLetterQueue;
use crate::envelope::Message;
use crate::handler::Handler;
use crate::metrics::{
    InMemoryMetrics, MetricsFanout, MetricsWorker, RedisMetricsProcessor, SharedMetrics,
};
use crate::middleware::{
    DeadLetterMiddleware, HandlerChain, MetricsMiddleware, RecoverMiddleware, RetryMiddleware,
    TracingMiddleware,
};
use crate::publisher::{PublishError, PublishReceipt, Publisher};
use crate::subscriber::{SubscribeError, Subscriber, SubscriptionKey};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument};

/// Errors raised while setting up a [`Client`]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configuration is inconsistent
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    /// The backend could not be reached
    #[error("unable to connect to backend")]
    Backend(#[from] BackendError),
}

/// Per-subscription overrides of the client defaults
#[derive(Clone, Default)]
pub struct SubscriptionOptions {
    /// Loop settings, [`ClientConfig::consumer`] if absent
    pub consumer: Option<ConsumerConfig>,
    /// Retry policy, [`ClientConfig::retry`] if absent
    pub retry: Option<RetryPolicy>,
    /// Whether terminal failures go to the dead-letter queue, [`DlqConfig::enabled`](crate::config::DlqConfig::enabled) if absent
    pub dead_letter: Option<bool>,
    /// Additional layers wrapped directly around the business handler
    pub middleware: HandlerChain,
}

/// Entry point for publishing, subscribing and dead-letter maintenance
///
/// ```no_run
/// use courier::{handler_fn, Client, HandlerError, Message};
/// use courier::config::ClientConfig;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::connect(ClientConfig::default()).await?;
///
/// client
///     .subscribe("activity.created", "chat", handler_fn(|message: Message| async move {
///         println!("{} bytes", message.payload().len());
///         Ok::<_, HandlerError>(())
///     }))
///     .await?;
///
/// client.publish("activity.created", r#"{"id":1}"#).await?;
/// client.close(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    backend: SharedBackend,
    config: ClientConfig,
    publisher: Publisher,
    subscriber: Subscriber,
    dlq: DeadLetterQueue,
    metrics: SharedMetrics,
    metrics_worker: Mutex<Option<MetricsWorker>>,
}

impl Client {
    /// Connects to the configured Redis instance
    ///
    /// Unless disabled, metrics are persisted into Redis in addition to being aggregated in memory.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let backend = RedisBackend::connect(&config.backend).await?;
        let mut worker = None;

        let metrics: SharedMetrics = if config.persist_metrics {
            let (processor, processor_worker) =
                RedisMetricsProcessor::spawn(backend.factory().multiplexed());
            worker = Some(processor_worker);

            Arc::new(MetricsFanout::new(vec![
                Arc::new(InMemoryMetrics::new()),
                Arc::new(processor),
            ]))
        } else {
            Arc::new(InMemoryMetrics::new())
        };

        info!(url = %config.backend.url, "Connected to backend");

        let client = Self::with_parts(Arc::new(backend), config, metrics)?;
        *client.metrics_worker() = worker;

        Ok(client)
    }

    /// Creates a client on an existing backend, aggregating metrics in memory
    pub fn with_backend(backend: SharedBackend, config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_parts(backend, config, Arc::new(InMemoryMetrics::new()))
    }

    /// Creates a client from its parts
    pub fn with_parts(
        backend: SharedBackend,
        config: ClientConfig,
        metrics: SharedMetrics,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let publisher = backend.create_publisher(config.publisher.clone(), metrics.clone());
        let subscriber = backend.create_subscriber(config.consumer.clone());
        let dlq = DeadLetterQueue::new(
            backend.clone(),
            publisher.clone(),
            config.dlq.clone(),
            metrics.clone(),
        );

        Ok(Self {
            backend,
            config,
            publisher,
            subscriber,
            dlq,
            metrics,
            metrics_worker: Mutex::new(None),
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Publisher used by this client
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Publishes an opaque payload to a topic
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PublishReceipt, PublishError> {
        self.publisher.publish(topic, payload).await
    }

    /// Publishes a pre-built message
    pub async fn publish_message(&self, message: Message) -> Result<PublishReceipt, PublishError> {
        self.publisher.publish_message(message).await
    }

    /// Publishes multiple messages in one round-trip, see [`Publisher::publish_batch`]
    pub async fn publish_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<Vec<PublishReceipt>, PublishError> {
        self.publisher.publish_batch(messages).await
    }

    /// Subscribes a handler using the configured defaults
    pub async fn subscribe<H>(&self, topic: &str, group: &str, handler: H) -> Result<(), SubscribeError>
    where
        H: Handler + 'static,
    {
        self.subscribe_with(topic, group, handler, SubscriptionOptions::default())
            .await
    }

    /// Subscribes a handler wrapped in the default handler chain
    #[instrument(skip(self, handler, options))]
    pub async fn subscribe_with<H>(
        &self,
        topic: &str,
        group: &str,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<(), SubscribeError>
    where
        H: Handler + 'static,
    {
        let consumer = options
            .consumer
            .clone()
            .unwrap_or_else(|| self.config.consumer.clone());
        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        retry.validate()?;

        let dead_letter = options.dead_letter.unwrap_or(self.config.dlq.enabled);
        if dead_letter && self.dlq.is_dead_letter_stream(topic) {
            return Err(SubscribeError::DeadLetterStream(topic.to_owned()));
        }

        let handler = options.middleware.build(Arc::new(handler));
        let handler = self.chain(group, retry, dead_letter).build(handler);

        self.subscriber
            .subscribe_with(topic, group, handler, consumer)
            .await
    }

    /// Default chain, outermost first: tracing, metrics, dead-letter, retry, panic recovery
    fn chain(&self, group: &str, retry: RetryPolicy, dead_letter: bool) -> HandlerChain {
        let mut chain = HandlerChain::new()
            .with(TracingMiddleware::new(group))
            .with(MetricsMiddleware::new(self.metrics.clone(), group));

        if dead_letter {
            chain = chain.with(DeadLetterMiddleware::new(
                self.dlq.clone(),
                group,
                self.metrics.clone(),
            ));
        }

        if retry.enabled {
            chain = chain.with(RetryMiddleware::new(retry, self.metrics.clone()));
        }

        chain.with(RecoverMiddleware)
    }

    /// Stops a subscription, waiting up to `timeout` for in-flight handlers
    pub async fn unsubscribe(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<(), SubscribeError> {
        self.subscriber.unsubscribe(topic, group, timeout).await
    }

    /// Active subscriptions
    pub async fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.subscriber.subscriptions().await
    }

    /// Dead-letter queue maintenance
    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// Metrics sink shared by all components, [`snapshot`](crate::metrics::MetricsSink::snapshot)
    /// serves the in-memory aggregates
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Verifies that the backend is reachable
    pub async fn health_check(&self) -> Result<(), BackendError> {
        self.backend.health_check().await
    }

    /// Stops all subscriptions, waiting up to `timeout` for in-flight handlers and queued
    /// metrics, and closes the backend
    pub async fn close(&self, timeout: Duration) -> Result<(), BackendError> {
        let deadline = Instant::now() + timeout;
        self.subscriber.close(timeout).await;

        let worker = self.metrics_worker().take();
        if let Some(worker) = worker {
            worker.finish(deadline).await;
        }

        self.backend.close().await
    }

    fn metrics_worker(&self) -> std::sync::MutexGuard<'_, Option<MetricsWorker>> {
        match self.metrics_worker.lock() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::backend::{MemoryBackend, StreamBackend};
    use crate::handler::{handler_fn, HandlerError};
    use crate::handler::BoxedHandler;
    use crate::metrics::MetricsSink;
    use crate::middleware::Middleware;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    const TOPIC: &str = "user.joined";
    const GROUP: &str = "credit";

    fn client() -> (Client, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = ClientConfig::default();
        config.consumer.block_time = Duration::from_millis(50);

        let client = Client::with_backend(backend.clone(), config).unwrap();
        (client, backend)
    }

    async fn await_pending(backend: &MemoryBackend, expected: usize) {
        for _ in 0..300 {
            if backend.pending(TOPIC, GROUP).await.unwrap() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }

        panic!("pending entries never reached {}", expected);
    }

    #[tokio::test]
    async fn reject_invalid_configuration() {
        let mut config = ClientConfig::default();
        config.retry.max_attempts = 0;

        assert!(matches!(
            Client::with_backend(Arc::new(MemoryBackend::new()), config),
            Err(ClientError::Config(ConfigError::MaxAttempts))
        ));
    }

    #[tokio::test]
    async fn dead_letter_panicking_handlers() {
        let (client, backend) = client();

        client
            .subscribe(
                TOPIC,
                GROUP,
                handler_fn(|_: Message| async move {
                    if true {
                        panic!("unexpected state");
                    }
                    Ok::<_, HandlerError>(())
                }),
            )
            .await
            .unwrap();
        client.publish(TOPIC, "x").await.unwrap();

        for _ in 0..300 {
            if client.dlq().count(TOPIC).await.unwrap() > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        await_pending(&backend, 0).await;
        let dead = client.dlq().list(TOPIC, 0, 10).await.unwrap();

        assert_eq!(dead.len(), 1);
        assert!(dead[0].failure_reason.contains("unexpected state"));
        assert_eq!(client.metrics().snapshot(TOPIC).unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn keep_failures_pending_without_dead_letter_queue() {
        let (client, backend) = client();
        let options = SubscriptionOptions {
            dead_letter: Some(false),
            retry: Some(RetryPolicy::disabled()),
            ..Default::default()
        };

        client
            .subscribe_with(
                TOPIC,
                GROUP,
                handler_fn(|_: Message| async move {
                    Err::<(), _>(HandlerError::permanent("nope"))
                }),
                options,
            )
            .await
            .unwrap();
        client.publish(TOPIC, "x").await.unwrap();

        await_pending(&backend, 1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(client.dlq().count(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refuse_to_dead_letter_dead_letter_streams() {
        let (client, _) = client();
        let handler = || handler_fn(|_: Message| async { Ok::<_, HandlerError>(()) });

        assert!(matches!(
            client.subscribe("orders.dlq", GROUP, handler()).await,
            Err(SubscribeError::DeadLetterStream(topic)) if topic == "orders.dlq"
        ));

        let options = SubscriptionOptions {
            dead_letter: Some(false),
            ..Default::default()
        };
        client
            .subscribe_with("orders.dlq", GROUP, handler(), options)
            .await
            .unwrap();
    }

    struct Stamp;

    impl Middleware for Stamp {
        fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
            Arc::new(handler_fn(move |mut message: Message| {
                let inner = inner.clone();
                async move {
                    message.metadata_mut().insert("stamped", "yes");
                    inner.handle(&mut message).await
                }
            }))
        }
    }

    #[tokio::test]
    async fn apply_custom_middleware_innermost() {
        let (client, _) = client();
        let (tx, mut rx) = mpsc::unbounded_channel();

        client
            .subscribe_with(
                TOPIC,
                GROUP,
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        tx.send(message).ok();
                        Ok::<_, HandlerError>(())
                    }
                }),
                SubscriptionOptions {
                    middleware: HandlerChain::new().with(Stamp),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        client.publish(TOPIC, "x").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.metadata().get("stamped"), Some("yes"));
    }

    #[tokio::test]
    async fn close_everything() {
        let (client, _) = client();
        client
            .subscribe(
                TOPIC,
                GROUP,
                handler_fn(|_: Message| async { Ok::<_, HandlerError>(()) }),
            )
            .await
            .unwrap();

        client.health_check().await.unwrap();
        client.close(Duration::from_secs(1)).await.unwrap();

        assert!(client.subscriptions().await.is_empty());
        assert!(client.health_check().await.is_err());
    }
}
