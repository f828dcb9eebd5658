use chrono::{DateTime, Utc};
use courier::dlq::{BatchOutcome, DlqMessage};
use courier::publisher::PublishReceipt;
use courier::{ErrorChain, ErrorKind, Message, Metadata};
use serde::Serialize;
use std::error::Error;

#[derive(Serialize)]
pub struct MessageView<'a> {
    id: &'a str,
    topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<&'a str>,
    created_at: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_base64: Option<String>,
    metadata: &'a Metadata,
}

impl<'a> From<&'a Message> for MessageView<'a> {
    fn from(message: &'a Message) -> Self {
        let text = std::str::from_utf8(message.payload()).ok();

        Self {
            id: message.id(),
            topic: message.topic(),
            sequence: message.sequence(),
            created_at: message.created_at(),
            payload: text,
            payload_base64: match text {
                Some(_) => None,
                None => Some(base64::encode(message.payload())),
            },
            metadata: message.metadata(),
        }
    }
}

#[derive(Serialize)]
pub struct DeadLetterView<'a> {
    dlq_id: Option<&'a str>,
    consumer_group: Option<&'a str>,
    failure_reason: &'a str,
    failure_kind: ErrorKind,
    failure_count: u32,
    first_failed_at: &'a DateTime<Utc>,
    last_failed_at: &'a DateTime<Utc>,
    moved_to_dlq_at: &'a DateTime<Utc>,
    error_history: &'a [String],
    message: MessageView<'a>,
}

impl<'a> From<&'a DlqMessage> for DeadLetterView<'a> {
    fn from(dead_letter: &'a DlqMessage) -> Self {
        Self {
            dlq_id: dead_letter.dlq_id.as_deref(),
            consumer_group: dead_letter.consumer_group.as_deref(),
            failure_reason: &dead_letter.failure_reason,
            failure_kind: dead_letter.failure_kind,
            failure_count: dead_letter.failure_count,
            first_failed_at: &dead_letter.first_failed_at,
            last_failed_at: &dead_letter.last_failed_at,
            moved_to_dlq_at: &dead_letter.moved_to_dlq_at,
            error_history: &dead_letter.error_history,
            message: MessageView::from(&dead_letter.message),
        }
    }
}

#[derive(Serialize)]
pub struct ReceiptView<'a> {
    message_id: &'a str,
    sequence: &'a str,
}

impl<'a> From<&'a PublishReceipt> for ReceiptView<'a> {
    fn from(receipt: &'a PublishReceipt) -> Self {
        Self {
            message_id: &receipt.message_id,
            sequence: &receipt.sequence,
        }
    }
}

#[derive(Serialize)]
pub struct OutcomeView<'a> {
    succeeded: &'a [String],
    failed: Vec<FailureView<'a>>,
}

#[derive(Serialize)]
struct FailureView<'a> {
    id: &'a str,
    error: String,
}

impl<'a> From<&'a BatchOutcome> for OutcomeView<'a> {
    fn from(outcome: &'a BatchOutcome) -> Self {
        Self {
            succeeded: &outcome.succeeded,
            failed: outcome
                .failed
                .iter()
                .map(|(id, error)| FailureView {
                    id,
                    error: ErrorChain::from(error as &(dyn Error + 'static)).compact(),
                })
                .collect(),
        }
    }
}
