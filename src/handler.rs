//! Business handlers and the error type they report back to the runtime
//!
//! A [`Handler`] receives one delivered [`Message`] at a time. Its result decides what happens
//! to the underlying stream entry: success acknowledges it, a failure is classified by its
//! [`ErrorKind`] and either retried, moved into the dead-letter queue or left pending.

use crate::backend::BackendError;
use crate::envelope::{Message, ValidationError};
use crate::error::{BoxedError, ErrorChain};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Classification of handler failures
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, never retried
    Validation,
    /// Temporary condition which may resolve itself
    Transient,
    /// Remote system unreachable
    Connection,
    /// Deadline exceeded
    Timeout,
    /// Handler explicitly asked not to retry
    Permanent,
    /// Handler crashed
    Fault,
    /// Anything else
    Unclassified,
}

impl ErrorKind {
    /// Default classification used when a retry policy does not list kinds explicitly
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::Unclassified
        )
    }

    /// Lower-case name used in logs and metadata
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Fault => "fault",
            ErrorKind::Unclassified => "unclassified",
        }
    }

    /// Infers the kind by walking the `source()` chain of an error
    pub fn classify(error: &(dyn Error + 'static)) -> Self {
        let mut current = Some(error);

        while let Some(error) = current {
            if let Some(kind) = Self::classify_single(error) {
                return kind;
            }

            current = error.source();
        }

        ErrorKind::Unclassified
    }

    fn classify_single(error: &(dyn Error + 'static)) -> Option<Self> {
        if error.is::<tokio::time::error::Elapsed>() {
            return Some(ErrorKind::Timeout);
        }

        if error.is::<ValidationError>() {
            return Some(ErrorKind::Validation);
        }

        if let Some(e) = error.downcast_ref::<BackendError>() {
            return match e {
                BackendError::Timeout(_) => Some(ErrorKind::Timeout),
                BackendError::Closed => Some(ErrorKind::Connection),
                _ => None,
            };
        }

        if let Some(e) = error.downcast_ref::<redis::RedisError>() {
            return if e.is_timeout() {
                Some(ErrorKind::Timeout)
            } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
                Some(ErrorKind::Connection)
            } else {
                None
            };
        }

        if let Some(e) = error.downcast_ref::<io::Error>() {
            return match e.kind() {
                io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::AddrNotAvailable => Some(ErrorKind::Connection),
                _ => None,
            };
        }

        None
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Reason(String);

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Reason {}

/// Failure reported by a [`Handler`]
///
/// Any error type can be converted using `?`, in which case the [`ErrorKind`] is inferred from the
/// error chain. Handlers that know better use the explicit constructors like
/// [`permanent`](HandlerError::permanent). Like `anyhow::Error` this type deliberately does not
/// implement [`std::error::Error`] itself, which would conflict with the blanket conversion.
pub struct HandlerError {
    kind: ErrorKind,
    source: BoxedError,
    attempts: u32,
    history: Vec<ErrorChain>,
}

impl HandlerError {
    /// Wraps an error with an explicit kind
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::from_boxed(kind, Box::new(error))
    }

    /// Wraps an already boxed error with an explicit kind
    pub fn from_boxed(kind: ErrorKind, source: BoxedError) -> Self {
        Self {
            kind,
            source,
            attempts: 1,
            history: Vec::new(),
        }
    }

    /// Creates an error from a plain message
    pub fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, Reason(message.into()))
    }

    /// Temporary failure, worth retrying
    pub fn transient(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Transient, message)
    }

    /// Failure that will not go away by retrying, routed to the dead-letter queue right away
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Permanent, message)
    }

    /// Handler crashed
    pub fn fault(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Fault, message)
    }

    /// Processing exceeded its deadline
    pub fn timeout(limit: Duration) -> Self {
        Self::msg(
            ErrorKind::Timeout,
            format!("processing did not finish within {:?}", limit),
        )
    }

    /// Classification of the failure
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Number of attempts made before this error was reported
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Errors of all previous attempts, oldest first, excluding this one
    pub fn history(&self) -> &[ErrorChain] {
        &self.history
    }

    /// Records the number of attempts made so far
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Records the errors of previous attempts
    pub fn with_history(mut self, history: Vec<ErrorChain>) -> Self {
        self.history = history;
        self
    }

    /// Flattened chain of this error
    pub fn chain(&self) -> ErrorChain {
        ErrorChain::from_boxed(&self.source)
    }

    /// Errors of every attempt including this one, oldest first
    pub fn full_history(&self) -> Vec<ErrorChain> {
        let mut history = self.history.clone();
        history.push(self.chain());
        history
    }

    /// Underlying error
    pub fn source(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Consumes the wrapper, returning the underlying error
    pub fn into_source(self) -> BoxedError {
        self.source
    }
}

impl<E> From<E> for HandlerError
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        let kind = ErrorKind::classify(&error);
        Self::new(kind, error)
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.chain().compact())
    }
}

impl Debug for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("attempts", &self.attempts)
            .field("history", &self.history)
            .finish()
    }
}

/// Outcome of processing one message
pub type HandlerResult = Result<(), HandlerError>;

/// Processes delivered messages
///
/// The message is handed out mutably so that outer layers of the handler chain can observe the
/// bookkeeping inner layers write into its metadata.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes one message
    async fn handle(&self, message: &mut Message) -> HandlerResult;
}

/// Dynamic dispatch version of [`Handler`], shareable between concurrent deliveries
pub type BoxedHandler = Arc<dyn Handler>;

/// [`Handler`] backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F> {
    f: F,
}

/// Creates a handler from an async closure receiving an owned copy of each message
///
/// ```no_run
/// use courier::{handler_fn, HandlerError, Message};
///
/// let handler = handler_fn(|message: Message| async move {
///     if message.payload().is_empty() {
///         return Err(HandlerError::permanent("nothing to do"));
///     }
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        (self.f)(message.clone()).await
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, message: &mut Message) -> HandlerResult {
        self.as_ref().handle(message).await
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("lookup failed")]
    struct LookupError(#[source] io::Error);

    fn convert<E: Error + Send + Sync + 'static>(error: E) -> HandlerError {
        error.into()
    }

    #[test]
    fn classify_connection_failures() {
        let error = convert(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(error.kind(), ErrorKind::Connection);
    }

    #[test]
    fn classify_through_the_source_chain() {
        let error = convert(LookupError(io::Error::new(io::ErrorKind::TimedOut, "slow")));
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(error.chain().causes(), &["lookup failed", "slow"]);
    }

    #[tokio::test]
    async fn classify_elapsed_deadlines() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), futures::future::pending::<()>())
            .await
            .unwrap_err();

        assert_eq!(convert(elapsed).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn classify_backend_failures_by_their_source() {
        let dropped = redis::RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(convert(BackendError::Redis(dropped)).kind(), ErrorKind::Connection);

        let slow = BackendError::Timeout(Duration::from_secs(5));
        assert_eq!(convert(slow).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn fall_back_to_unclassified() {
        let error = convert(io::Error::new(io::ErrorKind::Other, "strange"));
        assert_eq!(error.kind(), ErrorKind::Unclassified);
        assert!(error.kind().is_retryable());
    }

    #[test]
    fn never_retry_terminal_kinds() {
        for kind in [ErrorKind::Validation, ErrorKind::Permanent, ErrorKind::Fault] {
            assert!(!kind.is_retryable(), "{}", kind);
        }
    }

    #[test]
    fn collect_history() {
        let error = HandlerError::transient("third")
            .with_attempts(3)
            .with_history(vec![
                ErrorChain::from_message("first"),
                ErrorChain::from_message("second"),
            ]);

        let history: Vec<String> = error.full_history().iter().map(ErrorChain::compact).collect();
        assert_eq!(history, vec!["first", "second", "third"]);
        assert_eq!(error.to_string(), "transient error: third");
    }

    #[tokio::test]
    async fn call_closures() {
        let handler = handler_fn(|message: Message| async move {
            match message.payload() {
                b"ok" => Ok(()),
                _ => Err(HandlerError::permanent("unexpected payload")),
            }
        });

        assert!(handler.handle(&mut Message::new("abc", "ok")).await.is_ok());

        let error = handler
            .handle(&mut Message::new("abc", "nope"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Permanent);
    }
}
