//! Thin adapter over the durable log store
//!
//! Everything above this module talks to a [`StreamBackend`] trait object and never reasons about
//! the wire format of the underlying store. Two implementations exist:
//!
//! - [`RedisBackend`] using [Redis Streams](https://redis.io/topics/streams-intro)
//! - [`MemoryBackend`] keeping everything in-process, used for tests and local development
//!
//! The model follows the one of Redis Streams closely. A stream is an ordered log of entries, each
//! identified by a monotonically increasing sequence token and carrying a flat field map. Consumer
//! groups keep a cursor into the stream and a list of pending entries which have been delivered
//! to one of their consumers but not yet acknowledged.

mod memory;
mod redis;

pub use self::redis::*;
pub use memory::*;

use crate::config::{ConsumerConfig, PublisherConfig};
use crate::metrics::SharedMetrics;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by backend implementations
#[derive(Debug, Error)]
pub enum BackendError {
    /// Error reported by the Redis client
    #[error("redis operation failed")]
    Redis(#[from] ::redis::RedisError),
    /// Operation did not complete within the configured response timeout
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
    /// Consumer group has not been created for the stream
    #[error("consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup {
        /// Stream that was read from
        stream: String,
        /// Missing group
        group: String,
    },
    /// Sequence token could not be interpreted
    #[error("invalid entry id '{0}'")]
    InvalidId(String),
    /// Backend has been closed
    #[error("backend has been closed")]
    Closed,
}

/// Entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Sequence token assigned by the backend
    pub id: String,
    /// Field map of the entry, empty if the entry has been deleted while still pending
    pub fields: HashMap<String, String>,
}

/// Entry to be appended as part of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRecord {
    /// Stream to append to
    pub stream: String,
    /// Field-value pairs of the entry
    pub fields: Vec<(String, String)>,
}

/// Location from where a newly created consumer group begins to consume entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Start of the stream, no entry already in the log is skipped
    Beginning,
    /// End of the stream, only entries appended after the creation are delivered
    End,
}

/// What a consumer asks for when reading from its group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer but not yet acknowledged, strictly after the given id.
    /// Never blocks.
    Pending(String),
    /// Entries never delivered to any consumer of the group
    New,
}

impl ReadCursor {
    /// Cursor to start replaying pending entries from the very beginning
    pub fn pending_from_start() -> Self {
        ReadCursor::Pending("0-0".to_owned())
    }
}

/// Minimal contract of a durable, append-only log store with consumer groups
///
/// Implementations are shared between the publisher, all subscription loops and the dead-letter
/// queue and have to be safe for concurrent use.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Appends an entry and returns its sequence token.
    /// When `max_len` is given, the stream is approximately capped to that many entries.
    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
        max_len: Option<usize>,
    ) -> Result<String, BackendError>;

    /// Appends multiple entries in one round-trip where supported.
    ///
    /// There is no atomicity: when an error is returned, an arbitrary prefix of the batch may have been appended.
    async fn append_batch(
        &self,
        records: Vec<AppendRecord>,
        max_len: Option<usize>,
    ) -> Result<Vec<String>, BackendError>;

    /// Creates the stream and consumer group if they do not exist yet
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BackendError>;

    /// Reads up to `count` entries for a consumer within a group.
    ///
    /// Reading [`ReadCursor::New`] entries blocks for up to `block` when nothing is available
    /// (a zero duration does not block at all) and moves them into the pending list of the consumer.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BackendError>;

    /// Removes entries from the pending list of a group, returning how many were pending
    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<usize, BackendError>;

    /// Number of entries delivered to the group but not yet acknowledged
    async fn pending(&self, stream: &str, group: &str) -> Result<usize, BackendError>;

    /// Reads entries in log order, skipping the first `offset` ones
    async fn range(
        &self,
        stream: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, BackendError>;

    /// Reads a single entry by its sequence token
    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>, BackendError>;

    /// Deletes entries, returning how many existed
    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize, BackendError>;

    /// Number of entries in the stream, zero if it does not exist
    async fn len(&self, stream: &str) -> Result<usize, BackendError>;

    /// Evicts the oldest entries until at most `max_len` remain, returning the number evicted
    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, BackendError>;

    /// Deletes the whole stream including its consumer groups
    async fn remove(&self, stream: &str) -> Result<(), BackendError>;

    /// Verifies that the store is reachable
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Releases all resources, subsequent calls fail with [`BackendError::Closed`]
    async fn close(&self) -> Result<(), BackendError>;
}

/// Dynamic dispatch version of [`StreamBackend`] shared between all components
pub type SharedBackend = Arc<dyn StreamBackend>;

/// Factory functions for the components built on top of a backend
pub trait BackendExt {
    /// Creates a publisher appending to this backend
    fn create_publisher(&self, config: PublisherConfig, metrics: SharedMetrics) -> Publisher;

    /// Creates a subscriber consuming from this backend
    fn create_subscriber(&self, config: ConsumerConfig) -> Subscriber;
}

impl BackendExt for SharedBackend {
    fn create_publisher(&self, config: PublisherConfig, metrics: SharedMetrics) -> Publisher {
        Publisher::new(self.clone(), config, metrics)
    }

    fn create_subscriber(&self, config: ConsumerConfig) -> Subscriber {
        Subscriber::new(self.clone(), config)
    }
}
