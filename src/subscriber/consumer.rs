use super::delivery::{DeliveryCursor, DeliveryHandle};
use crate::backend::{BackendError, ReadCursor, StartPosition, StreamEntry};
use crate::config::ConsumerConfig;
use crate::envelope::{DecodeError, Message, WireRecord};
use crate::handler::BoxedHandler;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Polling loop of a single subscription
pub(super) struct Consumer {
    pub(super) cursor: Arc<DeliveryCursor>,
    pub(super) topic: String,
    pub(super) name: String,
    pub(super) config: ConsumerConfig,
    pub(super) handler: BoxedHandler,
}

struct ReadState {
    position: ReadCursor,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    /// Reads and processes entries until the shutdown signal is raised or its sender dropped.
    ///
    /// Entries pending for this consumer from an earlier run are drained first, afterwards only
    /// never-delivered entries are requested. Entries which have been read but not yet dispatched
    /// when the signal arrives are left pending.
    pub(super) async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("Subscription started");

        let reader = self.clone();
        let state = ReadState {
            position: ReadCursor::pending_from_start(),
            shutdown: shutdown.clone(),
        };

        stream::unfold(state, move |state| {
            let reader = reader.clone();
            async move { reader.next_batch(state).await }
        })
        .flat_map(stream::iter)
        .for_each_concurrent(self.config.concurrency, |entry| {
            let consumer = self.clone();
            let shutdown = shutdown.clone();

            async move {
                if *shutdown.borrow() {
                    debug!(entry = %entry.id, "Shutting down, leaving entry pending");
                } else {
                    consumer.process(entry).await;
                }
            }
        })
        .await;

        info!("Subscription stopped");
    }

    async fn next_batch(&self, mut state: ReadState) -> Option<(Vec<StreamEntry>, ReadState)> {
        if *state.shutdown.borrow() {
            return None;
        }

        let read = self.cursor.backend.read_group(
            &self.cursor.stream,
            &self.cursor.group,
            &self.name,
            state.position.clone(),
            self.config.batch_size,
            self.config.block_time,
        );

        let result = tokio::select! {
            result = read => result,
            _ = state.shutdown.changed() => return None,
        };

        match result {
            Ok(entries) => {
                if let ReadCursor::Pending(_) = state.position {
                    state.position = match entries.last() {
                        Some(entry) => ReadCursor::Pending(entry.id.clone()),
                        None => {
                            debug!("Caught up with pending entries");
                            ReadCursor::New
                        }
                    };
                }

                Some((entries, state))
            }
            Err(e) => {
                error!(error = %e, "Failed to read from stream");

                if let BackendError::NoGroup { .. } = e {
                    self.recreate_group().await;
                }

                tokio::select! {
                    _ = sleep(self.config.read_error_backoff) => {},
                    _ = state.shutdown.changed() => return None,
                }

                Some((Vec::new(), state))
            }
        }
    }

    /// The stream may have been removed while the loop was running
    async fn recreate_group(&self) {
        let result = self
            .cursor
            .backend
            .ensure_group(
                &self.cursor.stream,
                &self.cursor.group,
                StartPosition::Beginning,
            )
            .await;

        match result {
            Ok(_) => info!("Recreated consumer group"),
            Err(e) => warn!(error = %e, "Failed to recreate consumer group"),
        }
    }

    async fn process(&self, entry: StreamEntry) {
        let delivery = DeliveryHandle::new(self.cursor.clone(), entry.id.clone());

        let mut message = match self.decode(entry) {
            Ok(message) => message,
            Err(e) => {
                error!(entry = %delivery.entry_id(), error = %e, "Discarding unparsable entry");
                settle(delivery.ack().await, "unparsable entry");
                return;
            }
        };

        message.received_at = Some(Utc::now());

        // Acknowledged on receipt, the outcome of the handler no longer matters to the backend
        let delivery = if self.config.auto_ack {
            settle(delivery.ack().await, message.id());
            None
        } else {
            Some(delivery)
        };

        let outcome = timeout(self.config.process_timeout, self.handler.handle(&mut message)).await;

        match (outcome, delivery) {
            (Ok(Ok(())), Some(delivery)) => settle(delivery.ack().await, message.id()),
            (Ok(Ok(())), None) => {}
            (Ok(Err(e)), delivery) => {
                debug!(id = %message.id(), error = %e, "Handler failed");
                if let Some(delivery) = delivery {
                    delivery.nack();
                }
            }
            (Err(_), delivery) => {
                warn!(
                    id = %message.id(),
                    timeout = ?self.config.process_timeout,
                    "Processing timed out"
                );
                if let Some(delivery) = delivery {
                    delivery.nack();
                }
            }
        }
    }

    fn decode(&self, entry: StreamEntry) -> Result<Message, DecodeError> {
        WireRecord::from_fields(&entry.fields)?.into_message(self.topic.clone(), Some(entry.id))
    }
}

fn settle(result: Result<bool, BackendError>, subject: &str) {
    match result {
        Ok(true) => {}
        Ok(false) => debug!(%subject, "Entry was no longer pending"),
        Err(e) => warn!(%subject, error = %e, "Failed to acknowledge"),
    }
}
