//! Consumer-group runtime driving handlers with delivered messages
//!
//! Every subscription owns a dedicated task that block-reads its topic stream through a consumer
//! group and dispatches the entries to a handler. Entries are acknowledged once the handler
//! succeeded and stay pending otherwise, which makes delivery at-least-once:
//!
//! ```text
//! Delivered → Processing → Acked
//!                        → Pending (redeliverable)
//!                        → Moved to dead-letter queue (acked by the middleware)
//! ```
//!
//! Subscriptions are tracked in a registry owned by the [`Subscriber`] instance. Closing it stops
//! all loops from reading, waits a bounded amount of time for in-flight handlers and aborts the rest.
//! Messages whose handler did not complete remain pending.

mod consumer;
mod delivery;

pub use delivery::DeliveryHandle;

use crate::backend::{BackendError, SharedBackend, StartPosition};
use crate::config::{ConfigError, ConsumerConfig};
use crate::envelope::{validate_consumer_group, validate_topic, ValidationError};
use crate::handler::BoxedHandler;
use consumer::Consumer;
use delivery::DeliveryCursor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Errors returned when managing subscriptions
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// Topic or consumer group name is invalid
    #[error("invalid subscription")]
    Validation(#[from] ValidationError),
    /// Consumer settings would prevent the loop from making progress
    #[error("invalid consumer settings")]
    Config(#[from] ConfigError),
    /// The group is already consumed by this subscriber
    #[error("already subscribed to '{topic}' as '{group}'")]
    AlreadySubscribed {
        /// Subscribed topic
        topic: String,
        /// Subscribed group
        group: String,
    },
    /// No such subscription exists
    #[error("not subscribed to '{topic}' as '{group}'")]
    NotSubscribed {
        /// Requested topic
        topic: String,
        /// Requested group
        group: String,
    },
    /// Failures of a dead-letter stream can not be dead-lettered again
    #[error("'{0}' is a dead-letter stream, subscribe to it without dead-lettering")]
    DeadLetterStream(String),
    /// The consumer group could not be created
    #[error("unable to prepare consumer group")]
    Backend(#[from] BackendError),
    /// The subscriber has been closed
    #[error("subscriber has been closed")]
    Closed,
}

/// Topic and consumer group identifying a subscription
pub type SubscriptionKey = (String, String);

struct SubscriptionHandle {
    consumer: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    fn signal(&self) {
        // Fails only if the loop already exited
        self.shutdown.send(true).ok();
    }

    /// Waits for the loop to finish, aborting it once the deadline passed
    async fn join(mut self, deadline: Instant) -> bool {
        match timeout_at(deadline, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                self.task.abort();
                false
            }
        }
    }
}

/// Runs consumer-group subscriptions
pub struct Subscriber {
    backend: SharedBackend,
    config: ConsumerConfig,
    subscriptions: Mutex<HashMap<SubscriptionKey, SubscriptionHandle>>,
    closed: AtomicBool,
}

impl Subscriber {
    /// Creates a new instance whose subscriptions default to the given settings
    pub fn new(backend: SharedBackend, config: ConsumerConfig) -> Self {
        Self {
            backend,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Default settings of new subscriptions
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Starts consuming a topic as a member of the consumer group, using the default settings
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: BoxedHandler,
    ) -> Result<(), SubscribeError> {
        self.subscribe_with(topic, group, handler, self.config.clone())
            .await
    }

    /// Starts consuming a topic as a member of the consumer group
    ///
    /// The group is created at the beginning of the log if it does not exist yet, so messages
    /// published before the first subscription are delivered as well.
    pub async fn subscribe_with(
        &self,
        topic: &str,
        group: &str,
        handler: BoxedHandler,
        config: ConsumerConfig,
    ) -> Result<(), SubscribeError> {
        validate_topic(topic)?;
        validate_consumer_group(group)?;
        config.validate()?;

        let key = (topic.to_owned(), group.to_owned());
        self.ensure_vacant(&*self.subscriptions.lock().await, &key)?;

        // The registry stays usable while the backend call is in flight
        self.backend
            .ensure_group(topic, group, StartPosition::Beginning)
            .await?;

        let mut subscriptions = self.subscriptions.lock().await;
        self.ensure_vacant(&subscriptions, &key)?;

        let name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", group, Uuid::new_v4()));

        let consumer = Arc::new(Consumer {
            cursor: Arc::new(DeliveryCursor {
                backend: self.backend.clone(),
                stream: topic.to_owned(),
                group: group.to_owned(),
            }),
            topic: topic.to_owned(),
            name: name.clone(),
            config,
            handler,
        });

        let span = info_span!("subscription", %topic, %group, consumer = %name);
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(consumer.run(signal).instrument(span));

        subscriptions.insert(
            key,
            SubscriptionHandle {
                consumer: name,
                shutdown,
                task,
            },
        );

        Ok(())
    }

    fn ensure_vacant(
        &self,
        subscriptions: &HashMap<SubscriptionKey, SubscriptionHandle>,
        key: &SubscriptionKey,
    ) -> Result<(), SubscribeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubscribeError::Closed);
        }

        if subscriptions.contains_key(key) {
            return Err(SubscribeError::AlreadySubscribed {
                topic: key.0.clone(),
                group: key.1.clone(),
            });
        }

        Ok(())
    }

    /// Stops a subscription, waiting up to `timeout` for in-flight handlers
    pub async fn unsubscribe(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<(), SubscribeError> {
        let handle = self
            .subscriptions
            .lock()
            .await
            .remove(&(topic.to_owned(), group.to_owned()))
            .ok_or_else(|| SubscribeError::NotSubscribed {
                topic: topic.to_owned(),
                group: group.to_owned(),
            })?;

        let consumer = handle.consumer.clone();
        handle.signal();

        if handle.join(Instant::now() + timeout).await {
            debug!(%topic, %group, %consumer, "Unsubscribed");
        } else {
            warn!(%topic, %group, %consumer, "Aborted subscription after timeout");
        }

        Ok(())
    }

    /// Active subscriptions, sorted
    pub async fn subscriptions(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> =
            self.subscriptions.lock().await.keys().cloned().collect();

        keys.sort();
        keys
    }

    /// Stops every subscription and rejects new ones
    ///
    /// All loops are signalled at once and share the same deadline. Returns the number of
    /// subscriptions that had to be aborted.
    pub async fn close(&self, timeout: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let handles: Vec<(SubscriptionKey, SubscriptionHandle)> =
            self.subscriptions.lock().await.drain().collect();

        for (_, handle) in handles.iter() {
            handle.signal();
        }

        let deadline = Instant::now() + timeout;
        let mut aborted = 0;

        for ((topic, group), handle) in handles {
            if !handle.join(deadline).await {
                warn!(%topic, %group, "Aborted subscription after timeout");
                aborted += 1;
            }
        }

        info!(aborted, "Closed subscriber");
        aborted
    }
}
