use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, now_millis, DEFAULT_CONTENT_TYPE};

/// Headers attached to a subscription.
pub type Headers = HashMap<String, String>;

/// Additional information supplied with a publish.
///
/// Fields left unset fall back to generated values (a fresh message id, the
/// current time, the default content type).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMetadata {
    /// Explicit message identifier.
    pub message_id: Option<MessageId>,

    /// Explicit creation timestamp in milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,

    /// Content type of the payload.
    pub content_type: Option<String>,

    /// Correlation identifier.
    pub correlation_id: Option<String>,

    /// Ordering key for messages published without an explicit one.
    pub ordering_key: Option<Bytes>,
}

impl PublishMetadata {
    /// Sets the message identifier.
    #[must_use]
    pub fn with_message_id<I>(mut self, message_id: I) -> Self
    where
        I: Into<MessageId>,
    {
        self.message_id = Some(message_id.into());
        self
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type<S>(mut self, content_type: S) -> Self
    where
        S: Into<String>,
    {
        self.content_type = Some(content_type.into());
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

    /// Sets the ordering key.
    #[must_use]
    pub fn with_ordering_key<K>(mut self, ordering_key: K) -> Self
    where
        K: Into<Bytes>,
    {
        self.ordering_key = Some(ordering_key.into());
        self
    }

    /// Builds a message around `value` using this metadata.
    #[must_use]
    pub fn into_message(self, value: Bytes) -> Message {
        Message {
            value,
            message_id: self.message_id.unwrap_or_else(MessageId::generate),
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            content_type: self
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            correlation_id: self.correlation_id,
        }
    }

    /// Fills the fields `message` left unset: a correlation id it lacks, and
    /// the content type if it still carries the default one.
    ///
    /// The message's own id and timestamp are always kept.
    #[must_use]
    pub fn apply_to(&self, mut message: Message) -> Message {
        if message.correlation_id.is_none() {
            message.correlation_id.clone_from(&self.correlation_id);
        }
        if let Some(content_type) = &self.content_type {
            if message.content_type == DEFAULT_CONTENT_TYPE {
                message.content_type.clone_from(content_type);
            }
        }
        message
    }
}

/// Information about a subscriber, such as its address or connection id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberMetadata {
    /// Identifier of the subscriber.
    pub subscriber_id: String,

    /// Free-form headers.
    pub headers: Headers,
}

impl SubscriberMetadata {
    /// Creates metadata for the given subscriber id.
    pub fn new<S>(subscriber_id: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            subscriber_id: subscriber_id.into(),
            headers: Headers::new(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.insert(key.into(), value.into());
        self
    }
}
