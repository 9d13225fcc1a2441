use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type used when a publisher does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Unique identifier of a message.
///
/// Redelivered copies of a message share the same identifier and are treated
/// as the same logical message.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new random (UUIDv4) message identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A pub/sub message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The message payload.
    pub value: Bytes,

    /// Unique identifier used for tracking, acknowledgement and deduplication.
    pub message_id: MessageId,

    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,

    /// Content type of the payload, e.g. `application/json`.
    pub content_type: String,

    /// Optional identifier tying related messages together.
    pub correlation_id: Option<String>,
}

impl Message {
    /// Creates a message with a fresh identifier and the current timestamp.
    pub fn new<V>(value: V) -> Self
    where
        V: Into<Bytes>,
    {
        Self {
            value: value.into(),
            message_id: MessageId::generate(),
            timestamp: now_millis(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            correlation_id: None,
        }
    }

    /// Replaces the message identifier.
    #[must_use]
    pub fn with_message_id<I>(mut self, message_id: I) -> Self
    where
        I: Into<MessageId>,
    {
        self.message_id = message_id.into();
        self
    }

    /// Replaces the creation timestamp (milliseconds since the Unix epoch).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type<S>(mut self, content_type: S) -> Self
    where
        S: Into<String>,
    {
        self.content_type = content_type.into();
        self
    }

    /// Sets the correlation identifier.
    #[must_use]
    pub fn with_correlation_id<S>(mut self, correlation_id: S) -> Self
    where
        S: Into<String>,
    {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Size of the payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl From<Bytes> for Message {
    fn from(value: Bytes) -> Self {
        Self::new(value)
    }
}

impl From<&'static str> for Message {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

/// Acknowledgement for a delivered message.
///
/// An ack without an error means the message was processed successfully.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    /// Identifier of the acknowledged message.
    pub message_id: MessageId,

    /// Processing error, if any.
    pub error: Option<String>,
}

impl AckMessage {
    /// Acknowledges successful processing.
    #[must_use]
    pub const fn success(message_id: MessageId) -> Self {
        Self {
            message_id,
            error: None,
        }
    }

    /// Reports a processing failure.
    pub fn failure<E>(message_id: MessageId, error: E) -> Self
    where
        E: fmt::Display,
    {
        Self {
            message_id,
            error: Some(error.to_string()),
        }
    }

    /// Whether this ack reports success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Current wall clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_has_unique_id() {
        let first = Message::new("a");
        let second = Message::new("a");

        assert_ne!(first.message_id, second.message_id);
        assert_eq!(first.content_type, DEFAULT_CONTENT_TYPE);
        assert!(first.timestamp > 0);
    }

    #[test]
    fn test_builder() {
        let message = Message::new(Bytes::from_static(b"{}"))
            .with_message_id("id-1")
            .with_timestamp(42)
            .with_content_type("application/json")
            .with_correlation_id("req-7");

        assert_eq!(message.message_id.as_str(), "id-1");
        assert_eq!(message.timestamp, 42);
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(message.len(), 2);
    }

    #[test]
    fn test_ack_constructors() {
        let id = MessageId::from("m");
        assert!(AckMessage::success(id.clone()).is_success());

        let failed = AckMessage::failure(id, "boom");
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_message_id_serializes_as_string() {
        let json = serde_json::to_string(&MessageId::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}
