//! Chat message model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message identifier.
///
/// Client-minted ids are time-derived and strictly increasing; the server
/// echoes the same id back to acknowledge a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Which side of the conversation a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Composed locally.
    Sent,
    /// Pushed by the server.
    Received,
}

/// Delivery state of a locally composed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Not yet confirmed by the channel.
    Pending,
    /// Confirmed or echoed back by the server.
    Acknowledged,
}

/// Message validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Message text is empty")]
    Empty,
}

/// A chat message as kept in the timeline and the persisted snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Dedup and tie-break key.
    pub id: MessageId,
    /// UTF-8 content, never blank.
    pub text: String,
    /// Display name of the author.
    pub author: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Provenance.
    pub direction: Direction,
    /// Present only on sent messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryState>,
}

impl Message {
    /// Build a locally composed message in the `Pending` state.
    ///
    /// # Errors
    /// Returns `MessageError::Empty` if `text` is empty after trimming.
    pub fn outgoing(
        id: MessageId,
        text: impl Into<String>,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        let text = text.into();
        validate_text(&text)?;
        Ok(Self {
            id,
            text,
            author: author.into(),
            timestamp,
            direction: Direction::Sent,
            delivery: Some(DeliveryState::Pending),
        })
    }

    /// Build a message pushed by the server.
    #[must_use]
    pub fn incoming(
        id: MessageId,
        text: impl Into<String>,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            author: author.into(),
            timestamp,
            direction: Direction::Received,
            delivery: None,
        }
    }

    /// Timeline ordering key: `(timestamp, id)` ascending.
    #[must_use]
    pub const fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }

    /// Whether this is a sent message still waiting for confirmation.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.direction == Direction::Sent && self.delivery == Some(DeliveryState::Pending)
    }

    /// Mark a pending sent message as acknowledged.
    ///
    /// Returns `false` if the message was not pending; the transition
    /// never reverts.
    pub fn acknowledge(&mut self) -> bool {
        if self.is_pending() {
            self.delivery = Some(DeliveryState::Acknowledged);
            true
        } else {
            false
        }
    }
}

/// Reject text that is empty or whitespace-only.
///
/// # Errors
/// Returns `MessageError::Empty` for blank text.
pub fn validate_text(text: &str) -> Result<(), MessageError> {
    if text.trim().is_empty() {
        Err(MessageError::Empty)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_outgoing_rejects_blank() {
        let err = Message::outgoing(MessageId(1), "   \n\t", "alice", ts(0)).unwrap_err();
        assert_eq!(err, MessageError::Empty);
        assert!(Message::outgoing(MessageId(1), "", "alice", ts(0)).is_err());
    }

    #[test]
    fn test_outgoing_keeps_original_text() {
        let msg = Message::outgoing(MessageId(7), "  hi  ", "alice", ts(0)).unwrap();
        assert_eq!(msg.text, "  hi  ");
        assert_eq!(msg.direction, Direction::Sent);
        assert!(msg.is_pending());
    }

    #[test]
    fn test_acknowledge_is_one_way() {
        let mut msg = Message::outgoing(MessageId(1), "hello", "alice", ts(0)).unwrap();
        assert!(msg.acknowledge());
        assert_eq!(msg.delivery, Some(DeliveryState::Acknowledged));
        assert!(!msg.acknowledge());
        assert_eq!(msg.delivery, Some(DeliveryState::Acknowledged));
    }

    #[test]
    fn test_received_has_no_delivery_state() {
        let mut msg = Message::incoming(MessageId(1), "yo", "bob", ts(0));
        assert_eq!(msg.delivery, None);
        assert!(!msg.acknowledge());
        assert_eq!(msg.delivery, None);
    }

    #[test]
    fn test_serialized_shape() {
        let msg = Message::incoming(MessageId(42), "yo", "bob", ts(1_700_000_000));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], 42);
        assert_eq!(json["direction"], "received");
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20Z");
        assert!(json.get("delivery").is_none());

        let sent = Message::outgoing(MessageId(43), "hey", "alice", ts(1_700_000_000)).unwrap();
        let json = serde_json::to_value(&sent).unwrap();
        assert_eq!(json["delivery"], "pending");
    }
}
