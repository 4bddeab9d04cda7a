//! Ordered, deduplicated message log for one conversation scope.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::{Message, MessageId};

type SortKey = (DateTime<Utc>, MessageId);

/// Result of merging a message into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The id was new; the message was inserted.
    Inserted,
    /// The id matched a pending sent message, which is now acknowledged.
    Acknowledged,
    /// The id was already present; nothing changed.
    Duplicate,
}

impl MergeOutcome {
    /// Whether the merge changed the timeline.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Message timeline.
///
/// Always sorted by `(timestamp, id)` ascending and unique by `id`.
/// Merging is idempotent, so the resulting order never depends on the
/// order in which messages arrived.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: BTreeMap<SortKey, Message>,
    index: HashMap<MessageId, SortKey>,
}

impl Timeline {
    /// Create an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from a (possibly unsorted, possibly duplicated)
    /// sequence of messages.
    #[must_use]
    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut timeline = Self::new();
        for msg in messages {
            timeline.merge(msg);
        }
        timeline
    }

    /// Merge a message by id.
    ///
    /// An unknown id is inserted. A known id is a no-op unless the stored
    /// entry is a pending sent message and the incoming copy is not
    /// pending (an echo or a confirmed copy), in which case the stored
    /// entry is acknowledged in place.
    pub fn merge(&mut self, msg: Message) -> MergeOutcome {
        if let Some(key) = self.index.get(&msg.id) {
            let Some(existing) = self.entries.get_mut(key) else {
                return MergeOutcome::Duplicate;
            };
            if existing.is_pending() && !msg.is_pending() && existing.acknowledge() {
                return MergeOutcome::Acknowledged;
            }
            return MergeOutcome::Duplicate;
        }

        let key = msg.sort_key();
        self.index.insert(msg.id, key);
        self.entries.insert(key, msg);
        MergeOutcome::Inserted
    }

    /// Acknowledge a pending sent message.
    ///
    /// Returns `false` for unknown ids and for messages that are not
    /// pending.
    pub fn acknowledge(&mut self, id: MessageId) -> bool {
        self.index
            .get(&id)
            .and_then(|key| self.entries.get_mut(key))
            .is_some_and(Message::acknowledge)
    }

    /// Take a message out of the timeline.
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let key = self.index.remove(&id)?;
        self.entries.remove(&key)
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.index.get(&id).and_then(|key| self.entries.get(key))
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in timeline order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    /// Owned copy in timeline order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    /// Pending sent messages in enqueue order.
    ///
    /// Locally minted ids are strictly increasing, so id order is enqueue
    /// order even when timestamps tie or the clock stepped back.
    #[must_use]
    pub fn pending(&self) -> Vec<Message> {
        let mut pending: Vec<Message> = self
            .entries
            .values()
            .filter(|m| m.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.id);
        pending
    }

    /// Highest id present.
    #[must_use]
    pub fn max_id(&self) -> Option<MessageId> {
        self.index.keys().max().copied()
    }
}
