use super::Middleware;
use crate::envelope::Message;
use crate::handler::{BoxedHandler, Handler, HandlerError, HandlerResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// Contains panics of the inner handler so they cannot take down the subscription loop
///
/// A panic is reported as a [`Fault`](crate::handler::ErrorKind::Fault), which is never retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoverMiddleware;

impl Middleware for RecoverMiddleware {
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        Arc::new(RecoverHandler { inner })
    }
}

struct RecoverHandler {
    inner: BoxedHandler,
}

#[async_trait]
impl Handler for RecoverHandler {
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        match AssertUnwindSafe(self.inner.handle(message)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(&panic);
                error!(reason = %reason, "Handler panicked");
                Err(HandlerError::fault(format!("handler panicked: {}", reason)))
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
