//! Wire protocol for the realtime channel.
//!
//! Every frame is a named event: `{"event": "<name>", "data": <payload>}`.

use chat_sync_core::{Message, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message body as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
}

impl MessagePayload {
    /// Convert an inbound payload into a received timeline entry.
    #[must_use]
    pub fn into_received(self) -> Message {
        Message::incoming(self.id, self.text, self.author, self.timestamp)
    }
}

impl From<&Message> for MessagePayload {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            text: msg.text.clone(),
            timestamp: msg.timestamp,
            author: msg.author.clone(),
        }
    }
}

/// Event from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Chat message.
    Message(MessagePayload),
    /// Keepalive, sent by the manager every `ping_interval_ms` while connected.
    Ping,
}

/// Event from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Chat message pushed by the server, possibly an echo of our own.
    Message(MessagePayload),
    /// Explicit delivery confirmation.
    Ack { id: MessageId },
    /// Server-side error report.
    Error { message: String },
    /// Keepalive response.
    Pong,
}

impl ClientEvent {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEvent {
    /// Decode a JSON text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known event.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
