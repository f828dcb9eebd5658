use crate::backend::StreamEntry;
use crate::envelope::{keys, DecodeError, Message, WireRecord};
use crate::handler::{ErrorKind, HandlerError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const FIELD_TOPIC: &str = "topic";
const FIELD_GROUP: &str = "consumer_group";
const FIELD_REASON: &str = "failure_reason";
const FIELD_KIND: &str = "failure_kind";
const FIELD_COUNT: &str = "failure_count";
const FIELD_FIRST_FAILED_AT: &str = "first_failed_at";
const FIELD_LAST_FAILED_AT: &str = "last_failed_at";
const FIELD_HISTORY: &str = "error_history";
const FIELD_MOVED_AT: &str = "moved_to_dlq_at";

/// Message which exhausted its retry budget or failed permanently
#[derive(Debug, Clone, PartialEq)]
pub struct DlqMessage {
    /// The failed message as it was last seen by the handler, including its failure metadata
    pub message: Message,
    /// Sequence token of the entry in the dead-letter stream, `None` until it has been sent
    pub dlq_id: Option<String>,
    /// Consumer group whose handler failed
    pub consumer_group: Option<String>,
    /// Error of the last attempt
    pub failure_reason: String,
    /// Classification of the last error
    pub failure_kind: ErrorKind,
    /// Number of failed attempts
    pub failure_count: u32,
    /// Time of the first failed attempt
    pub first_failed_at: DateTime<Utc>,
    /// Time of the last failed attempt
    pub last_failed_at: DateTime<Utc>,
    /// Errors of every attempt, oldest first
    pub error_history: Vec<String>,
    /// Time the message entered the dead-letter queue
    pub moved_to_dlq_at: DateTime<Utc>,
}

impl DlqMessage {
    /// Builds the failure record for a message whose processing failed terminally
    pub fn from_failure(
        message: &Message,
        error: &HandlerError,
        consumer_group: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let reason = error.chain().compact();
        let mut message = message.clone();

        // Without a retry layer nobody recorded the failure yet
        if !message.metadata.contains_key(keys::RETRY_COUNT) {
            message
                .metadata
                .record_failure(error.attempts(), &reason, now);
        }

        let first_failed_at = message
            .metadata
            .timestamp(keys::FIRST_FAILED_AT)
            .unwrap_or(now);
        let last_failed_at = message
            .metadata
            .timestamp(keys::LAST_FAILED_AT)
            .unwrap_or(now);

        Self {
            message,
            dlq_id: None,
            consumer_group,
            failure_reason: reason,
            failure_kind: error.kind(),
            failure_count: error.attempts().max(1),
            first_failed_at,
            last_failed_at,
            error_history: error
                .full_history()
                .iter()
                .map(|chain| chain.compact())
                .collect(),
            moved_to_dlq_at: now,
        }
    }

    /// Topic the message was originally published to
    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    /// Whether the given identifier refers to this record, either as dead-letter entry or as message
    pub fn matches(&self, id: &str) -> bool {
        self.dlq_id.as_deref() == Some(id) || self.message.id() == id
    }

    pub(super) fn into_fields(self) -> Result<Vec<(String, String)>, serde_json::Error> {
        let mut fields = WireRecord::from_message(&self.message)?.into_fields();

        fields.extend(vec![
            (FIELD_TOPIC.to_owned(), self.message.topic),
            (FIELD_REASON.to_owned(), self.failure_reason),
            (FIELD_KIND.to_owned(), self.failure_kind.as_str().to_owned()),
            (FIELD_COUNT.to_owned(), self.failure_count.to_string()),
            (
                FIELD_FIRST_FAILED_AT.to_owned(),
                self.first_failed_at.to_rfc3339(),
            ),
            (
                FIELD_LAST_FAILED_AT.to_owned(),
                self.last_failed_at.to_rfc3339(),
            ),
            (
                FIELD_HISTORY.to_owned(),
                serde_json::to_string(&self.error_history)?,
            ),
            (
                FIELD_MOVED_AT.to_owned(),
                self.moved_to_dlq_at.to_rfc3339(),
            ),
        ]);

        if let Some(group) = self.consumer_group {
            fields.push((FIELD_GROUP.to_owned(), group));
        }

        Ok(fields)
    }

    pub(super) fn from_entry(entry: StreamEntry) -> Result<Self, DecodeError> {
        let fields = &entry.fields;
        let field = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(DecodeError::MissingField(name))
        };

        let topic = field(FIELD_TOPIC)?.to_owned();
        let message = WireRecord::from_fields(fields)?.into_message(topic, None)?;
        let failure_kind = serde_json::from_value(serde_json::Value::String(
            field(FIELD_KIND)?.to_owned(),
        ))
        .map_err(|_| DecodeError::Malformed(FIELD_KIND))?;
        let failure_count = field(FIELD_COUNT)?
            .parse()
            .map_err(|_| DecodeError::Malformed(FIELD_COUNT))?;

        Ok(Self {
            message,
            dlq_id: Some(entry.id.clone()),
            consumer_group: fields.get(FIELD_GROUP).cloned(),
            failure_reason: field(FIELD_REASON)?.to_owned(),
            failure_kind,
            failure_count,
            first_failed_at: timestamp(fields, FIELD_FIRST_FAILED_AT)?,
            last_failed_at: timestamp(fields, FIELD_LAST_FAILED_AT)?,
            error_history: serde_json::from_str(field(FIELD_HISTORY)?)?,
            moved_to_dlq_at: timestamp(fields, FIELD_MOVED_AT)?,
        })
    }
}

fn timestamp(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<DateTime<Utc>, DecodeError> {
    let value = fields.get(name).ok_or(DecodeError::MissingField(name))?;

    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|_| DecodeError::Timestamp(value.clone()))
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::error::ErrorChain;
    use pretty_assertions::assert_eq;

    fn failed() -> (Message, HandlerError) {
        let message = Message::new("activity.created", "payload");
        let error = HandlerError::transient("still down")
            .with_attempts(3)
            .with_history(vec![
                ErrorChain::from_message("refused"),
                ErrorChain::from_message("reset"),
            ]);

        (message, error)
    }

    #[test]
    fn summarize_the_failure() {
        let (message, error) = failed();
        let dlq = DlqMessage::from_failure(&message, &error, Some("chat".into()));

        assert_eq!(dlq.failure_count, 3);
        assert_eq!(dlq.failure_kind, ErrorKind::Transient);
        assert_eq!(dlq.failure_reason, "still down");
        assert_eq!(dlq.error_history, vec!["refused", "reset", "still down"]);
        assert_eq!(dlq.message.retry_count(), 3);
        assert!(dlq.first_failed_at <= dlq.moved_to_dlq_at);
    }

    #[test]
    fn survive_the_stream() {
        let (message, error) = failed();
        let dlq = DlqMessage::from_failure(&message, &error, Some("chat".into()));

        let entry = StreamEntry {
            id: "5-0".into(),
            fields: dlq.clone().into_fields().unwrap().into_iter().collect(),
        };
        let decoded = DlqMessage::from_entry(entry).unwrap();

        assert_eq!(decoded.dlq_id.as_deref(), Some("5-0"));
        assert_eq!(decoded.topic(), "activity.created");
        assert_eq!(decoded.message.id(), message.id());
        assert_eq!(decoded.message.metadata(), dlq.message.metadata());
        assert_eq!(decoded.error_history, dlq.error_history);
        assert_eq!(decoded.consumer_group.as_deref(), Some("chat"));
        assert_eq!(
            decoded.moved_to_dlq_at.timestamp(),
            dlq.moved_to_dlq_at.timestamp()
        );
        assert!(decoded.matches("5-0"));
        assert!(decoded.matches(message.id()));
    }
}
