use super::Middleware;
use crate::envelope::Message;
use crate::handler::{BoxedHandler, Handler, HandlerResult};
use crate::metrics::{MetricsEntry, SharedMetrics};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

pub use crate::config::RetryPolicy;

/// Retries failed attempts within the same delivery, waiting with exponential backoff in between
///
/// Every failure is recorded in the message metadata (`retry_count`, `first_failed_at`,
/// `last_failed_at`, `last_error`). Errors that are not retryable according to the policy, or
/// that occur on the last permitted attempt, are passed outwards carrying the number of attempts
/// and the errors of all previous ones.
#[derive(Clone)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
    metrics: SharedMetrics,
}

impl RetryMiddleware {
    /// Creates a new instance reporting retried attempts to the given sink
    pub fn new(policy: RetryPolicy, metrics: SharedMetrics) -> Self {
        Self { policy, metrics }
    }
}

impl Middleware for RetryMiddleware {
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        Arc::new(RetryHandler {
            inner,
            policy: self.policy.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

struct RetryHandler {
    inner: BoxedHandler,
    policy: RetryPolicy,
    metrics: SharedMetrics,
}

#[async_trait]
impl Handler for RetryHandler {
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        let mut history = Vec::new();
        let mut attempt = 1;

        loop {
            let error = match self.inner.handle(message).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(attempt, "Succeeded after retrying");
                    }
                    return Ok(());
                }
                Err(error) => error,
            };

            let chain = error.chain();
            message
                .metadata_mut()
                .record_failure(attempt, &chain.compact(), Utc::now());

            let retryable = self.policy.enabled && self.policy.is_retryable(error.kind());
            if !retryable || attempt >= self.policy.max_attempts {
                return Err(error.with_attempts(attempt).with_history(history));
            }

            let delay = self.policy.delay(attempt);
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                kind = %error.kind(),
                error = %chain.compact(),
                ?delay,
                "Handler failed, retrying"
            );

            self.metrics.record(MetricsEntry::RetryAttempted {
                topic: message.topic().to_owned(),
                attempt,
            });

            history.push(chain);
            attempt += 1;
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::envelope::keys;
    use crate::handler::{handler_fn, ErrorKind, HandlerError};
    use crate::metrics::{InMemoryMetrics, MetricsSink};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const TOPIC: &str = "activity.created";

    /// Fails with the given errors in order and succeeds afterwards
    fn flaky(failures: Vec<HandlerError>) -> (BoxedHandler, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(std::sync::Mutex::new(failures.into_iter()));

        let counter = calls.clone();
        let handler = handler_fn(move |_: Message| {
            let failures = failures.clone();
            let counter = counter.clone();

            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let failure = failures.lock().unwrap().next();

                match failure {
                    Some(error) => Err(error),
                    None => Ok(()),
                }
            }
        });

        (Arc::new(handler), calls)
    }

    fn retrying(policy: RetryPolicy, inner: BoxedHandler) -> (BoxedHandler, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handler = RetryMiddleware::new(policy, metrics.clone()).wrap(inner);

        (handler, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_between_attempts() {
        let (inner, calls) = flaky(vec![
            HandlerError::transient("first"),
            HandlerError::transient("second"),
        ]);
        let (handler, metrics) = retrying(RetryPolicy::default(), inner);

        let start = Instant::now();
        let mut message = Message::new(TOPIC, "x");
        handler.handle(&mut message).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(message.retry_count(), 2);
        assert_eq!(message.metadata().get(keys::LAST_ERROR), Some("second"));
        assert_eq!(metrics.snapshot(TOPIC).unwrap().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn give_up_after_max_attempts() {
        let (inner, calls) = flaky(vec![
            HandlerError::transient("1"),
            HandlerError::transient("2"),
            HandlerError::transient("3"),
            HandlerError::transient("4"),
        ]);
        let (handler, _) = retrying(RetryPolicy::default(), inner);

        let mut message = Message::new(TOPIC, "x");
        let error = handler.handle(&mut message).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(error.attempts(), 3);
        assert_eq!(error.history().len(), 2);
        assert_eq!(message.retry_count(), 3);
        assert!(message.metadata().contains_key(keys::FIRST_FAILED_AT));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_retries_for_permanent_errors() {
        let (inner, calls) = flaky(vec![HandlerError::permanent("invalid")]);
        let (handler, metrics) = retrying(RetryPolicy::default(), inner);

        let error = handler
            .handle(&mut Message::new(TOPIC, "x"))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.kind(), ErrorKind::Permanent);
        assert_eq!(error.attempts(), 1);
        assert_eq!(metrics.snapshot(TOPIC), None);
    }

    #[tokio::test(start_paused = true)]
    async fn honour_explicit_kinds() {
        let policy = RetryPolicy {
            retryable_kinds: Some(vec![ErrorKind::Permanent]),
            ..Default::default()
        };
        let (inner, calls) = flaky(vec![
            HandlerError::permanent("retry me anyway"),
            HandlerError::transient("but not me"),
        ]);
        let (handler, _) = retrying(policy, inner);

        let error = handler
            .handle(&mut Message::new(TOPIC, "x"))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(error.kind(), ErrorKind::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_when_disabled() {
        let (inner, calls) = flaky(vec![HandlerError::transient("down")]);
        let (handler, _) = retrying(RetryPolicy::disabled(), inner);

        assert!(handler.handle(&mut Message::new(TOPIC, "x")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
