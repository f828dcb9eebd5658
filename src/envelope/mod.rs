//! Wire-level message structure, its validation and its encoding into stream entries
//!
//! A [`Message`] is the unit of transport. It carries an opaque payload and a flat string map of
//! [`Metadata`], part of which is reserved for the runtime itself (trace propagation and failure
//! bookkeeping, see [`keys`]). Before a message touches the network it has to pass [`validate`],
//! afterwards it is turned into a [`WireRecord`] which is what actually gets appended to the log.

mod validator;
mod wire;

pub use validator::*;
pub use wire::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Reserved metadata keys used by the runtime
pub mod keys {
    /// Trace identifier of the publishing execution context (32 hex chars)
    pub const TRACE_ID: &str = "trace_id";
    /// Span identifier of the publishing execution context (16 hex chars)
    pub const SPAN_ID: &str = "span_id";
    /// Name of the service which published the message
    pub const SOURCE_SERVICE: &str = "source_service";
    /// MIME type of the payload, purely informational
    pub const CONTENT_TYPE: &str = "content_type";
    /// Number of failed processing attempts so far
    pub const RETRY_COUNT: &str = "retry_count";
    /// RFC 3339 timestamp of the first failed attempt
    pub const FIRST_FAILED_AT: &str = "first_failed_at";
    /// RFC 3339 timestamp of the most recent failed attempt
    pub const LAST_FAILED_AT: &str = "last_failed_at";
    /// Error text of the most recent failed attempt
    pub const LAST_ERROR: &str = "last_error";
    /// RFC 3339 timestamp at which the message was re-published from the dead-letter queue
    pub const REPROCESSED_AT: &str = "reprocessed_at";
    /// Dead-letter stream the message was re-published from
    pub const REPROCESSED_FROM: &str = "reprocessed_from";
    /// How often the message has been re-published from the dead-letter queue
    pub const REPROCESS_COUNT: &str = "reprocess_count";

    /// Keys describing the failure history of a single delivery, stripped on reprocessing
    pub const RETRY_KEYS: [&str; 4] = [RETRY_COUNT, FIRST_FAILED_AT, LAST_FAILED_AT, LAST_ERROR];
}

/// String to string map attached to every message
///
/// Ordering is irrelevant for the semantics, a sorted map is used so that the encoded form is stable.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Creates an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Stores a value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes a key, returning its value
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates all entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// All keys in order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size in bytes of the JSON encoding which is stored on the wire
    pub fn encoded_size(&self) -> usize {
        serde_json::to_string(&self.0)
            .map(|encoded| encoded.len())
            .unwrap_or(usize::MAX)
    }

    /// Number of failed attempts recorded so far, zero if absent or malformed
    pub fn retry_count(&self) -> u32 {
        self.get(keys::RETRY_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or_default()
    }

    /// Parses an RFC 3339 timestamp stored under the given key
    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc))
    }

    /// Stores a timestamp in RFC 3339 format
    pub fn set_timestamp(&mut self, key: &str, timestamp: DateTime<Utc>) {
        self.insert(key, timestamp.to_rfc3339());
    }

    /// Records a failed processing attempt (1-based).
    /// The time of the first failure is only written if it is not yet known.
    pub fn record_failure(&mut self, attempt: u32, error: &str, at: DateTime<Utc>) {
        self.insert(keys::RETRY_COUNT, attempt.to_string());
        self.insert(keys::LAST_ERROR, error);
        self.set_timestamp(keys::LAST_FAILED_AT, at);

        if !self.contains_key(keys::FIRST_FAILED_AT) {
            self.set_timestamp(keys::FIRST_FAILED_AT, at);
        }
    }

    /// Removes all keys recording the failure history of a delivery
    pub fn strip_retry_keys(&mut self) {
        for key in keys::RETRY_KEYS.iter() {
            self.0.remove(*key);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Unit of transport
///
/// Created by business code, completed by the [`Publisher`](crate::publisher::Publisher)
/// (identifier, trace metadata) and reconstructed by the [`Subscriber`](crate::subscriber::Subscriber)
/// on every delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) id: String,
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) metadata: Metadata,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) received_at: Option<DateTime<Utc>>,
    pub(crate) sequence: Option<String>,
}

impl Message {
    /// Creates a new message with a random identifier and a creation time of `Utc::now()`
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
            received_at: None,
            sequence: None,
        }
    }

    /// Replaces the identifier, e.g. with a natural idempotency key
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Unique identifier assigned at publication
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Topic the message is published to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Opaque payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message, returning the payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Attached metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable access to the attached metadata
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Instant at which the message was published, truncated to whole seconds after transport
    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    /// Instant at which the consumer received the message, `None` before delivery
    pub fn received_at(&self) -> Option<&DateTime<Utc>> {
        self.received_at.as_ref()
    }

    /// Sequence token assigned to the entry by the backend, `None` before it has been appended
    pub fn sequence(&self) -> Option<&str> {
        self.sequence.as_deref()
    }

    /// Number of failed processing attempts recorded in the metadata
    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count()
    }
}
