use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{PROVISIONAL_ID_PREFIX, ROOM_ID_PREFIX};

// Marketplace user identity = numeric account id assigned by the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Key of a two-party conversation: `room-{min}-{max}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Either participant computes the same key without a lookup.
    pub fn for_pair(a: UserId, b: UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{ROOM_ID_PREFIX}{lo}-{hi}"))
    }

    /// Recover the participant pair from a well-formed room key.
    pub fn participants(&self) -> Option<[UserId; 2]> {
        let rest = self.0.strip_prefix(ROOM_ID_PREFIX)?;
        let (a, b) = rest.split_once('-')?;
        let a = a.parse::<u64>().ok()?;
        let b = b.parse::<u64>().ok()?;
        Some([UserId(a), UserId(b)])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Client-side id used until the send endpoint returns the persisted copy.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_is_symmetric() {
        for (a, b) in [(5, 9), (9, 5), (1, 1), (0, u64::MAX), (42, 7)] {
            assert_eq!(
                RoomId::for_pair(UserId(a), UserId(b)),
                RoomId::for_pair(UserId(b), UserId(a))
            );
        }
    }

    #[test]
    fn test_room_id_orders_numerically() {
        // 10 < 9 lexically, but not numerically
        assert_eq!(RoomId::for_pair(UserId(10), UserId(9)).as_str(), "room-9-10");
        assert_eq!(RoomId::for_pair(UserId(5), UserId(9)).as_str(), "room-5-9");
    }

    #[test]
    fn test_room_participants() {
        let room = RoomId::for_pair(UserId(12), UserId(3));
        assert_eq!(room.participants(), Some([UserId(3), UserId(12)]));
        assert_eq!(RoomId("general".into()).participants(), None);
    }

    #[test]
    fn test_provisional_ids() {
        let id = MessageId::provisional();
        assert!(id.is_provisional());
        assert_ne!(id, MessageId::provisional());
        assert!(!MessageId::from("srv-1").is_provisional());
    }
}
