//! Decorators around business handlers
//!
//! Each [`Middleware`] turns a handler into another handler. A [`HandlerChain`] applies an ordered
//! list of them once, when a subscription is built, producing a single composed handler. The
//! first middleware added ends up outermost. The default chain used by the
//! [`Client`](crate::client::Client) is, from the outside in:
//!
//! 1. [`TracingMiddleware`] restores the publisher's trace context
//! 2. [`MetricsMiddleware`] measures every delivery
//! 3. [`DeadLetterMiddleware`] moves terminal failures into the dead-letter queue
//! 4. [`RetryMiddleware`] retries classified failures with backoff
//! 5. [`RecoverMiddleware`] turns panics into [`Fault`](crate::handler::ErrorKind::Fault) errors

mod dead_letter;
mod metrics;
mod propagation;
mod recover;
mod retry;

pub use dead_letter::*;
pub use metrics::*;
pub use propagation::*;
pub use recover::*;
pub use retry::*;

use crate::handler::BoxedHandler;
use std::sync::Arc;

/// Handler transformation applied at subscription-build time
pub trait Middleware: Send + Sync {
    /// Wraps the inner handler
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler;
}

/// Ordered list of middleware
#[derive(Default, Clone)]
pub struct HandlerChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl HandlerChain {
    /// Creates an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware which will be nested inside all previously added ones
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain has no layers
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps the handler in all layers
    pub fn build(&self, handler: BoxedHandler) -> BoxedHandler {
        self.layers
            .iter()
            .rev()
            .fold(handler, |inner, layer| layer.wrap(inner))
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::envelope::Message;
    use crate::handler::{handler_fn, Handler, HandlerError, HandlerResult};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Tag(&'static str);

    struct Tagged {
        tag: &'static str,
        inner: BoxedHandler,
    }

    #[async_trait]
    impl Handler for Tagged {
        async fn handle(&self, message: &mut Message) -> HandlerResult {
            let seen = message.metadata().get("order").unwrap_or_default().to_owned();
            message.metadata_mut().insert("order", seen + self.tag);
            self.inner.handle(message).await
        }
    }

    impl Middleware for Tag {
        fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
            Arc::new(Tagged { tag: self.0, inner })
        }
    }

    #[tokio::test]
    async fn apply_first_layer_outermost() {
        let chain = HandlerChain::new().with(Tag("a")).with(Tag("b")).with(Tag("c"));
        let handler = chain.build(Arc::new(handler_fn(|message: Message| async move {
            assert_eq!(message.metadata().get("order"), Some("abc"));
            Ok::<_, HandlerError>(())
        })));

        let mut message = Message::new("abc", "x");
        handler.handle(&mut message).await.unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(message.metadata().get("order"), Some("abc"));
    }
}
