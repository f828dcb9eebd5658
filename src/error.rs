//! Crate-wide error aliases and the serializable error chain stored alongside dead letters

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;

/// Type erased, serializable error which retains the error chain information
///
/// Failures are recorded in the dead-letter queue long after the original error value is gone
/// and possibly inspected by a process that does not know the concrete error types. The chain
/// keeps the message of every error in the `source()` hierarchy so that operators still see
/// the full picture.
///
/// When the error from which this is created contains another `ErrorChain` in its source
/// chain, it will be consumed and integrated so that one flat list of causes results.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ErrorChain(Vec<String>);

impl ErrorChain {
    /// Creates a new instance from any error type
    ///
    /// Due to std providing default implementations for the `From<T> where T: T` trait,
    /// we can't both implement `Error` and `From<Error>` and have to decide on one.
    pub fn new<E: Error + 'static>(e: E) -> Self {
        (&e as &(dyn Error + 'static)).into()
    }

    /// Creates a new instance from a boxed error type
    pub fn from_boxed(e: &BoxedError) -> Self {
        (e.as_ref() as &(dyn Error + 'static)).into()
    }

    /// Creates a chain consisting of a single free-form cause
    pub fn from_message(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    /// Top-level cause, if any
    pub fn head(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// All causes, top-level first
    pub fn causes(&self) -> &[String] {
        &self.0
    }

    /// Consumes the error and returns the underlying list of causes
    pub fn into_causes(self) -> Vec<String> {
        self.0
    }

    /// Single-line rendering of all causes, joined by `: `
    pub fn compact(&self) -> String {
        self.0.join(": ")
    }
}

impl Error for ErrorChain {}

impl Display for ErrorChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(first) = self.0.first() {
            writeln!(f, "Error: {}", first)?;
        } else {
            writeln!(f, "Unknown error")?;
            return Ok(());
        }

        if self.0.len() > 1 {
            writeln!(f, "\nCaused by:")?;
            for (index, cause) in self.0.iter().skip(1).enumerate() {
                writeln!(f, "    {}: {}", index, cause)?;
            }
        }

        Ok(())
    }
}

impl From<&(dyn Error + 'static)> for ErrorChain {
    fn from(e: &(dyn Error + 'static)) -> Self {
        let mut source: Option<&(dyn Error + 'static)> = Some(e);
        let mut causes: Vec<String> = Vec::new();

        while let Some(error) = source {
            // Integrate any child chains and use ToString for anything else
            if let Some(chain) = error.downcast_ref::<ErrorChain>() {
                let mut child_causes = chain.0.clone();
                causes.append(&mut child_causes);
            } else {
                causes.push(error.to_string());
            }

            source = error.source();
        }

        Self(causes)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use thiserror::Error;

    #[derive(Error, Debug)]
    enum TestError {
        #[error("handler failed")]
        Internal(#[from] ErrorChain),
    }

    fn chain_of(causes: &[&str]) -> ErrorChain {
        ErrorChain(causes.iter().map(|c| c.to_string()).collect())
    }

    #[test]
    fn handle_no_cause() {
        assert_eq!(ErrorChain::default().to_string(), "Unknown error\n");
    }

    #[test]
    fn consume_nested() {
        let lower_error = chain_of(&["connection reset", "broken pipe"]);
        let middle_error = TestError::from(lower_error);
        let high_error = ErrorChain::from(&middle_error as &(dyn Error + 'static));

        assert_eq!(
            high_error.causes(),
            &["handler failed", "connection reset", "broken pipe"]
        );
    }

    #[test]
    fn format_correctly() {
        let formatted = chain_of(&["cause1", "cause2", "cause3"]).to_string();

        assert_eq!(
            formatted,
            r#"Error: cause1

Caused by:
    0: cause2
    1: cause3
"#
        )
    }

    #[test]
    fn render_compact() {
        assert_eq!(chain_of(&["a", "b"]).compact(), "a: b");
        assert_eq!(chain_of(&["a", "b"]).head(), Some("a"));
    }
}
