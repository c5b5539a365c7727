use std::fmt;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::Event;

/// Content-derived deduplication key.
///
/// Two submissions of the same event carry the same uuid, name, timestamp and
/// distinct id, and therefore the same key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct DedupKey {
    pub uuid: Uuid,
    pub event_name: String,
    pub timestamp_ms: i64,
    pub distinct_id: String,
}

impl DedupKey {
    pub fn new(uuid: Uuid, event_name: String, timestamp_ms: i64, distinct_id: String) -> Self {
        Self {
            uuid,
            event_name,
            timestamp_ms,
            distinct_id,
        }
    }

    /// Fixed-size hex digest used as the storage key.
    ///
    /// Variable-length fields are length-prefixed so that no two distinct keys can
    /// collide by shifting bytes between neighbouring fields.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.uuid.as_bytes());
        hasher.update(self.timestamp_ms.to_be_bytes());
        for field in [&self.event_name, &self.distinct_id] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl From<&Event> for DedupKey {
    fn from(event: &Event) -> Self {
        Self::new(
            event.uuid,
            event.event.clone(),
            event.timestamp.timestamp_millis(),
            event.distinct_id.clone(),
        )
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.uuid, self.event_name, self.timestamp_ms, self.distinct_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(uuid: Uuid, name: &str, ts: i64, distinct_id: &str) -> DedupKey {
        DedupKey::new(uuid, name.to_string(), ts, distinct_id.to_string())
    }

    #[test]
    fn test_same_fields_produce_same_digest() {
        let uuid = Uuid::now_v7();
        assert_eq!(
            key(uuid, "$pageview", 1_700_000_000_000, "user-1").digest(),
            key(uuid, "$pageview", 1_700_000_000_000, "user-1").digest()
        );
    }

    #[test]
    fn test_every_field_participates_in_the_digest() {
        let uuid = Uuid::now_v7();
        let base = key(uuid, "$pageview", 1_700_000_000_000, "user-1").digest();

        assert_ne!(base, key(Uuid::now_v7(), "$pageview", 1_700_000_000_000, "user-1").digest());
        assert_ne!(base, key(uuid, "$pageleave", 1_700_000_000_000, "user-1").digest());
        assert_ne!(base, key(uuid, "$pageview", 1_700_000_000_001, "user-1").digest());
        assert_ne!(base, key(uuid, "$pageview", 1_700_000_000_000, "user-2").digest());
    }

    #[test]
    fn test_field_boundaries_cannot_be_shifted() {
        let uuid = Uuid::now_v7();
        assert_ne!(
            key(uuid, "ab", 0, "c").digest(),
            key(uuid, "a", 0, "bc").digest()
        );
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = key(Uuid::now_v7(), "e", 0, "d").digest();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
