//! Reliable, topic based messaging on top of durable, append-only log streams.
//!
//! Messages are published into a stream per topic and consumed through named consumer groups.
//! Each group keeps its own cursor, so every group sees every message while members within one
//! group share the work. Delivery is at-least-once: an entry stays pending for its group until it
//! has been acknowledged, either because the handler succeeded or because the entry has been
//! moved into the dead-letter queue.
//!
//! The modules form a chain of dependencies from the wire-level [`envelope`] over the swappable
//! [`backend`] adapter and the [`publisher`] / [`subscriber`] runtime, through the [`middleware`]
//! that wraps business [`handler`]s with retries, dead-lettering, metrics and trace propagation,
//! up to the [`Client`](client::Client) façade which wires everything together.

#![warn(missing_docs)]

pub mod backend;
pub mod client;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod helpers;
pub mod metrics;
pub mod middleware;
pub mod publisher;
pub mod subscriber;
pub mod telemetry;

pub use client::Client;
pub use envelope::{Message, Metadata};
pub use error::{BoxedError, EmptyResult, ErrorChain};
pub use handler::{handler_fn, ErrorKind, Handler, HandlerError, HandlerResult};
