use super::Middleware;
use crate::envelope::Message;
use crate::handler::{BoxedHandler, Handler, HandlerResult};
use crate::metrics::{MetricsEntry, Outcome, SharedMetrics};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Records the outcome and latency of every delivery passing through the chain
#[derive(Clone)]
pub struct MetricsMiddleware {
    metrics: SharedMetrics,
    group: String,
}

impl MetricsMiddleware {
    /// Creates a new instance attributing observations to the given consumer group
    pub fn new(metrics: SharedMetrics, group: impl Into<String>) -> Self {
        Self {
            metrics,
            group: group.into(),
        }
    }
}

impl Middleware for MetricsMiddleware {
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        Arc::new(MetricsHandler {
            inner,
            layer: self.clone(),
        })
    }
}

struct MetricsHandler {
    inner: BoxedHandler,
    layer: MetricsMiddleware,
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        let start = Instant::now();
        let result = self.inner.handle(message).await;

        self.layer.metrics.record(MetricsEntry::Processed {
            topic: message.topic().to_owned(),
            group: self.layer.group.clone(),
            latency: start.elapsed(),
            outcome: Outcome::of(&result),
        });

        result
    }
}
