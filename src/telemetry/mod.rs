//! Trace propagation across the publish / consume boundary
//!
//! Publisher and consumer run in different processes, so the identifiers of the active
//! OpenTelemetry span travel inside the message metadata. [`TraceContext`] moves them between an
//! [`opentelemetry::Context`] and the reserved [metadata keys](crate::envelope::keys).

mod propagation;

pub use propagation::*;

use opentelemetry::Context;

/// Name of the service that originated the current execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName(pub String);

/// Service name attached to the current OpenTelemetry context, if any
pub fn current_service() -> Option<String> {
    Context::current()
        .get::<ServiceName>()
        .map(|name| name.0.clone())
}
