use super::Message;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Minimum number of characters in a topic
pub const MIN_TOPIC_LENGTH: usize = 3;
/// Maximum number of characters in a topic
pub const MAX_TOPIC_LENGTH: usize = 128;
/// Maximum number of characters in a consumer group name
pub const MAX_GROUP_LENGTH: usize = 128;
/// Maximum payload size in bytes (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
/// Maximum size of the JSON encoded metadata in bytes (10 KiB)
pub const MAX_METADATA_SIZE: usize = 10 * 1024;

lazy_static! {
    static ref TOPIC_PATTERN: Regex = Regex::new(r"^[a-z0-9._-]+$").unwrap();
    static ref GROUP_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9._:-]+$").unwrap();
}

/// Reasons why a message may not be published
///
/// None of these are ever retried, they are handed back to the caller synchronously.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Message carries an empty identifier
    #[error("message id must not be empty")]
    EmptyId,
    /// Topic is too short or too long
    #[error(
        "topic '{topic}' must be between {} and {} characters long",
        MIN_TOPIC_LENGTH,
        MAX_TOPIC_LENGTH
    )]
    TopicLength {
        /// Offending topic
        topic: String,
    },
    /// Topic contains characters outside of `[a-z0-9._-]`
    #[error("topic '{topic}' may only contain lower-case alphanumerics, '.', '_' and '-'")]
    TopicCharacters {
        /// Offending topic
        topic: String,
    },
    /// Consumer group name is empty, too long or contains illegal characters
    #[error("consumer group '{group}' is invalid")]
    ConsumerGroup {
        /// Offending group name
        group: String,
    },
    /// Payload has no content
    #[error("payload must not be empty")]
    EmptyPayload,
    /// Payload exceeds [`MAX_PAYLOAD_SIZE`]
    #[error("payload of {size} bytes exceeds the limit of {} bytes", MAX_PAYLOAD_SIZE)]
    PayloadTooLarge {
        /// Size of the rejected payload
        size: usize,
    },
    /// Encoded metadata exceeds [`MAX_METADATA_SIZE`]
    #[error("metadata of {size} bytes exceeds the limit of {} bytes", MAX_METADATA_SIZE)]
    MetadataTooLarge {
        /// Encoded size of the rejected metadata
        size: usize,
    },
}

/// Checks all invariants a message has to satisfy before it may be appended to a stream
pub fn validate(message: &Message) -> Result<(), ValidationError> {
    if message.id.is_empty() {
        return Err(ValidationError::EmptyId);
    }

    validate_topic(&message.topic)?;

    let size = message.payload.len();
    if size == 0 {
        return Err(ValidationError::EmptyPayload);
    } else if size > MAX_PAYLOAD_SIZE {
        return Err(ValidationError::PayloadTooLarge { size });
    }

    let size = message.metadata.encoded_size();
    if size > MAX_METADATA_SIZE {
        return Err(ValidationError::MetadataTooLarge { size });
    }

    Ok(())
}

/// Checks the naming rules for topics
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    let length = topic.chars().count();

    if !(MIN_TOPIC_LENGTH..=MAX_TOPIC_LENGTH).contains(&length) {
        Err(ValidationError::TopicLength {
            topic: topic.to_owned(),
        })
    } else if !TOPIC_PATTERN.is_match(topic) {
        Err(ValidationError::TopicCharacters {
            topic: topic.to_owned(),
        })
    } else {
        Ok(())
    }
}

/// Checks the naming rules for consumer groups
pub fn validate_consumer_group(group: &str) -> Result<(), ValidationError> {
    if group.is_empty() || group.len() > MAX_GROUP_LENGTH || !GROUP_PATTERN.is_match(group) {
        Err(ValidationError::ConsumerGroup {
            group: group.to_owned(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::envelope::Metadata;
    use pretty_assertions::assert_eq;

    fn message(topic: &str, payload: Vec<u8>) -> Message {
        Message::new(topic, payload)
    }

    #[test]
    fn accept_valid_messages() {
        let longest = "x".repeat(MAX_TOPIC_LENGTH);

        for topic in ["abc", "activity.created", "user_joined-v2", "a.b", longest.as_str()] {
            assert_eq!(validate(&message(topic, vec![1])), Ok(()), "{}", topic);
        }
    }

    #[test]
    fn reject_topics_of_invalid_length() {
        let too_long = "x".repeat(MAX_TOPIC_LENGTH + 1);

        for topic in ["", "ab", too_long.as_str()] {
            assert!(matches!(
                validate_topic(topic),
                Err(ValidationError::TopicLength { .. })
            ));
        }
    }

    #[test]
    fn reject_topics_with_invalid_characters() {
        for topic in ["Activity", "activity created", "activity/created", "täst", "a*b"] {
            assert!(
                matches!(
                    validate_topic(topic),
                    Err(ValidationError::TopicCharacters { .. })
                ),
                "{}",
                topic
            );
        }
    }

    #[test]
    fn reject_empty_payload() {
        assert_eq!(
            validate(&message("activity.created", Vec::new())),
            Err(ValidationError::EmptyPayload)
        );
    }

    #[test]
    fn enforce_payload_limit() {
        let exact = message("activity.created", vec![0; MAX_PAYLOAD_SIZE]);
        let oversized = message("activity.created", vec![0; MAX_PAYLOAD_SIZE + 1]);

        assert_eq!(validate(&exact), Ok(()));
        assert_eq!(
            validate(&oversized),
            Err(ValidationError::PayloadTooLarge {
                size: MAX_PAYLOAD_SIZE + 1
            })
        );
    }

    #[test]
    fn enforce_metadata_limit() {
        let mut oversized = message("activity.created", vec![1]);
        oversized.metadata = vec![("blob", "x".repeat(MAX_METADATA_SIZE))]
            .into_iter()
            .collect::<Metadata>();

        assert!(matches!(
            validate(&oversized),
            Err(ValidationError::MetadataTooLarge { .. })
        ));
    }

    #[test]
    fn reject_empty_id() {
        let anonymous = message("activity.created", vec![1]).with_id("");
        assert_eq!(validate(&anonymous), Err(ValidationError::EmptyId));
    }

    #[test]
    fn check_consumer_groups() {
        assert_eq!(validate_consumer_group("chat-service"), Ok(()));
        assert_eq!(validate_consumer_group("Credit.Score:v1"), Ok(()));
        assert!(validate_consumer_group("").is_err());
        assert!(validate_consumer_group("with space").is_err());
    }
}
