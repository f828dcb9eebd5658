use super::{Message, Metadata};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Field holding the message identifier
pub const FIELD_ID: &str = "id";
/// Field holding the base64 encoded payload
pub const FIELD_PAYLOAD: &str = "payload";
/// Field holding the JSON encoded metadata
pub const FIELD_METADATA: &str = "metadata";
/// Field holding the creation time in unix seconds
pub const FIELD_CREATED_AT: &str = "created_at";

/// Errors that occur while turning a stream entry back into a [`Message`]
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A mandatory field is absent
    #[error("field '{0}' missing from stream entry")]
    MissingField(&'static str),
    /// The payload is not valid base64
    #[error("payload is not valid base64")]
    Payload(#[from] base64::DecodeError),
    /// The metadata is not a valid JSON string map
    #[error("metadata is not a valid JSON object")]
    Metadata(#[from] serde_json::Error),
    /// A field does not hold a value of the expected type
    #[error("field '{0}' is malformed")]
    Malformed(&'static str),
    /// The creation time is not a unix timestamp
    #[error("creation time '{0}' is not a valid unix timestamp")]
    Timestamp(String),
}

/// Backend agnostic representation of one log entry
///
/// The payload is base64 encoded so that text-only stores can carry arbitrary bytes. The
/// creation time is truncated to whole seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    /// Message identifier
    pub id: String,
    /// Base64 encoded payload
    pub payload: String,
    /// JSON encoded metadata
    pub metadata: String,
    /// Creation time in unix seconds
    pub created_at: i64,
}

impl WireRecord {
    /// Encodes a message
    pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: message.id.clone(),
            payload: base64::encode(&message.payload),
            metadata: serde_json::to_string(&message.metadata)?,
            created_at: message.created_at.timestamp(),
        })
    }

    /// Flattens the record into field-value pairs for appending
    pub fn into_fields(self) -> Vec<(String, String)> {
        vec![
            (FIELD_ID.to_owned(), self.id),
            (FIELD_PAYLOAD.to_owned(), self.payload),
            (FIELD_METADATA.to_owned(), self.metadata),
            (FIELD_CREATED_AT.to_owned(), self.created_at.to_string()),
        ]
    }

    /// Reassembles a record from the fields of a stream entry
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let field = |name: &'static str| {
            fields
                .get(name)
                .cloned()
                .ok_or(DecodeError::MissingField(name))
        };

        let created_at = field(FIELD_CREATED_AT)?;

        Ok(Self {
            id: field(FIELD_ID)?,
            payload: field(FIELD_PAYLOAD)?,
            metadata: field(FIELD_METADATA)?,
            created_at: created_at
                .parse()
                .map_err(|_| DecodeError::Timestamp(created_at.clone()))?,
        })
    }

    /// Decodes the record into a message on the given topic
    ///
    /// The `sequence` is the identifier the backend assigned to the entry.
    pub fn into_message(
        self,
        topic: impl Into<String>,
        sequence: Option<String>,
    ) -> Result<Message, DecodeError> {
        let payload = base64::decode(&self.payload)?;
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;
        let created_at = Utc
            .timestamp_opt(self.created_at, 0)
            .single()
            .ok_or_else(|| DecodeError::Timestamp(self.created_at.to_string()))?;

        Ok(Message {
            id: self.id,
            topic: topic.into(),
            payload,
            metadata,
            created_at,
            received_at: None,
            sequence,
        })
    }
}
