use super::Middleware;
use crate::envelope::Message;
use crate::handler::{BoxedHandler, Handler, HandlerResult};
use crate::telemetry::TraceContext;
use async_trait::async_trait;
use opentelemetry::trace::FutureExt;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// Continues the trace of the publisher while a message is being processed
///
/// The identifiers carried in the metadata become the remote parent of the OpenTelemetry context
/// the inner handlers run in, so that [`TraceContext::current`] and everything published from
/// within the handler stay part of the same trace. Messages without valid identifiers run in the
/// ambient context.
#[derive(Debug, Clone, Default)]
pub struct TracingMiddleware {
    group: Option<String>,
}

impl TracingMiddleware {
    /// Creates a new instance tagging its spans with the given consumer group
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
        }
    }
}

impl Middleware for TracingMiddleware {
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        Arc::new(TracingHandler {
            inner,
            group: self.group.clone(),
        })
    }
}

struct TracingHandler {
    inner: BoxedHandler,
    group: Option<String>,
}

#[async_trait]
impl Handler for TracingHandler {
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        let carried = TraceContext::extract(message.metadata());

        let span = info_span!(
            "process",
            topic = %message.topic(),
            id = %message.id(),
            group = self.group.as_deref().unwrap_or_default(),
            trace_id = carried.as_ref().map(|cx| cx.trace_id.as_str()).unwrap_or_default(),
        );

        let cx = match carried {
            Some(carried) => carried.into_context(),
            None => Context::current(),
        };

        self.inner
            .handle(message)
            .with_context(cx)
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::envelope::keys;
    use crate::handler::{handler_fn, HandlerError};
    use crate::telemetry::current_service;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";

    fn observing() -> (BoxedHandler, Arc<Mutex<Option<(TraceContext, Option<String>)>>>) {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let handler = TracingMiddleware::new("audit").wrap(Arc::new(handler_fn(
            move |_: Message| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = Some((TraceContext::current(), current_service()));
                    Ok::<_, HandlerError>(())
                }
            },
        )));

        (handler, seen)
    }

    #[tokio::test]
    async fn continue_publisher_trace() {
        let (handler, seen) = observing();
        let mut message = Message::new("activity.created", "x")
            .with_metadata(keys::TRACE_ID, TRACE_ID)
            .with_metadata(keys::SPAN_ID, SPAN_ID)
            .with_metadata(keys::SOURCE_SERVICE, "activity");

        handler.handle(&mut message).await.unwrap();

        let (context, service) = seen.lock().unwrap().take().unwrap();
        assert_eq!(context.trace_id, TRACE_ID);
        assert_eq!(service.as_deref(), Some("activity"));
    }

    #[tokio::test]
    async fn run_untraced_messages_in_ambient_context() {
        let (handler, seen) = observing();
        let mut message = Message::new("activity.created", "x").with_metadata(keys::TRACE_ID, "nope");

        handler.handle(&mut message).await.unwrap();

        let (context, service) = seen.lock().unwrap().take().unwrap();
        assert_ne!(context.trace_id, TRACE_ID);
        assert_eq!(service, None);
    }
}
