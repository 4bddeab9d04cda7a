//! Message id generation.

use chat_sync_core::MessageId;
use chrono::{DateTime, Utc};

/// Time-derived, strictly increasing message ids.
///
/// Each id is `max(now_ms, last + 1)`, so ids never repeat even when the
/// clock stalls or steps back.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    last: u64,
}

impl IdGenerator {
    /// Start above `seed`, typically the highest id in a restored timeline.
    #[must_use]
    pub fn new(seed: Option<MessageId>) -> Self {
        Self {
            last: seed.map_or(0, MessageId::get),
        }
    }

    /// Next id for a message created at `now`.
    pub fn next_at(&mut self, now: DateTime<Utc>) -> MessageId {
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        self.last = now_ms.max(self.last.saturating_add(1));
        MessageId(self.last)
    }

    /// Account for an id minted elsewhere so later ids land above it.
    pub fn observe(&mut self, id: MessageId) {
        self.last = self.last.max(id.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_follows_clock() {
        let mut ids = IdGenerator::default();
        assert_eq!(ids.next_at(at(1_000)), MessageId(1_000));
        assert_eq!(ids.next_at(at(2_500)), MessageId(2_500));
    }

    #[test]
    fn test_same_millisecond_still_increases() {
        let mut ids = IdGenerator::default();
        let a = ids.next_at(at(1_000));
        let b = ids.next_at(at(1_000));
        let c = ids.next_at(at(1_000));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_clock_step_back() {
        let mut ids = IdGenerator::default();
        ids.next_at(at(5_000));
        assert_eq!(ids.next_at(at(10)), MessageId(5_001));
    }

    #[test]
    fn test_observed_ids_are_skipped() {
        let mut ids = IdGenerator::default();
        ids.observe(MessageId(1_200));
        assert_eq!(ids.next_at(at(1_000)), MessageId(1_201));
        ids.observe(MessageId(7));
        assert_eq!(ids.next_at(at(1_000)), MessageId(1_202));
    }

    #[test]
    fn test_seed_from_restored_timeline() {
        let mut ids = IdGenerator::new(Some(MessageId(9_000)));
        assert_eq!(ids.next_at(at(1_000)), MessageId(9_001));
    }
}
