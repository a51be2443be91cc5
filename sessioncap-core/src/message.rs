//! Telemetry messages as seen by the commit pipeline.
//!
//! The pipeline treats messages as opaque apart from the two kinds it
//! produces itself: the timestamp marker that opens every batch and the
//! metadata entries flushed on start. Producers (observers, plugins) use
//! [`Message::Custom`] or [`Message::Event`].

use serde::{Deserialize, Serialize};

/// A single telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Capture time in milliseconds since the Unix epoch
    Timestamp { timestamp: i64 },

    /// Session metadata entry
    Metadata { key: String, value: String },

    /// Application-defined event with a string payload
    Custom { name: String, payload: String },

    /// Structured event produced by an observer
    Event {
        kind: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl Message {
    pub fn is_timestamp(&self) -> bool {
        matches!(self, Message::Timestamp { .. })
    }
}

/// A flushed group of messages.
///
/// The first element is always a [`Message::Timestamp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    /// Build a batch from buffered messages, prepending the capture marker.
    pub fn new(timestamp: i64, buffered: Vec<Message>) -> Self {
        let mut messages = Vec::with_capacity(buffered.len() + 1);
        messages.push(Message::Timestamp { timestamp });
        messages.extend(buffered);
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
