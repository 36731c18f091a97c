//! Room lifecycle and messaging payload types.
//!
//! Covers room creation, join/leave, message sends, the fan-out record for
//! accepted messages, and history paging. The room id always travels in the
//! frame header, never in the CBOR body.

use serde::{Deserialize, Serialize};

/// Room category.
///
/// Fixed at creation; a room never changes kind. `Direct` rooms are
/// synthesized by the server from a user pair and cannot be created
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomKind {
    /// Interest-based channel.
    Topic,
    /// Geography-based channel.
    Region,
    /// Creator community channel.
    Community,
    /// Pairwise direct-message channel.
    Direct,
}

/// Member role within a room.
///
/// Ordered by authority: `Member < Moderator < Admin`. Moderation checks
/// compare with `>=`, so the derive order here is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Ordinary participant.
    Member,
    /// Can warn, mute, kick, and delete messages.
    Moderator,
    /// Full authority, including role changes and permanent bans.
    Admin,
}

/// Message content category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Plain text content.
    Text,
    /// Attachment reference; content is the file URL.
    File,
    /// Attachment reference; content is the image URL.
    Image,
}

/// Create a room definition
///
/// Idempotent: creating a room that already exists is acknowledged without
/// modifying the existing definition. The creator becomes the room's first
/// member with role `Admin` on their subsequent join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoom {
    /// Room category. `Direct` is rejected here; direct rooms are
    /// synthesized implicitly on first message.
    pub kind: RoomKind,

    /// Maximum member count. Joins beyond this are rejected, not queued.
    pub capacity: u32,

    /// Private rooms admit only invited users.
    pub private: bool,
}

/// Add a user to a private room's allow list
///
/// Requires role `Admin` in the room. Inviting an already-listed user is a
/// no-op acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    /// User to authorize for joining.
    pub user_id: u64,
}

/// Send a message to a room
///
/// The sender must hold a current membership and must not be under an
/// active mute or ban. For `File`/`Image` kinds the content carries the
/// attachment URL produced out-of-band; the server validates it is
/// non-empty and carries it opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    /// Message body, or attachment URL for non-text kinds.
    pub content: String,

    /// Content category.
    pub kind: MessageKind,

    /// Message id this message replies to. The reference is recorded even
    /// if the target was tombstoned; it is a link, not a read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
}

/// Send a message to a single recipient
///
/// The recipient user id travels in the frame header's `target_id`. The
/// server resolves the pair to its canonical direct room, creating it on
/// first contact; the Ack frame's header carries the resolved room id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Message body, or attachment URL for non-text kinds.
    pub content: String,

    /// Content category.
    pub kind: MessageKind,
}

/// Accepted message record
///
/// Fanned out to room members as `RoomMessageEvent` and returned in
/// `HistoryResponse` pages. Immutable once accepted; moderation deletion
/// tombstones the record server-side and stops all future fan-out, but
/// already-delivered copies are not recalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Canonical message id assigned by the store.
    pub id: u64,

    /// Authoring user.
    pub sender_id: u64,

    /// Room-scoped monotonic sequence number, starting at 1. Delivery
    /// order within a room equals sequence order.
    pub sequence: u64,

    /// Content category.
    pub kind: MessageKind,

    /// Message body, or attachment URL for non-text kinds.
    pub content: String,

    /// Message id this message replies to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,

    /// Resolved mention targets (deduplicated user ids, sender excluded).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mentions: Vec<u64>,

    /// Server wall clock at acceptance, Unix milliseconds.
    pub created_at_ms: u64,
}

/// A user joined the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJoined {
    /// Joining user.
    pub user_id: u64,

    /// Display name from the user directory, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Role granted on join.
    pub role: Role,

    /// Server wall clock at join, Unix milliseconds.
    pub joined_at_ms: u64,
}

/// A user left the room
///
/// Emitted for explicit leaves and for implicit leaves when a user's last
/// live connection disconnects. Kicks and bans additionally produce a
/// `ModerationEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberLeft {
    /// Departing user.
    pub user_id: u64,
}

/// Request a page of room history
///
/// History serves cold start after a join; accepted messages are never
/// replayed through live fan-out. Pages run newest-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Exclusive upper bound: return messages with sequence strictly below
    /// this. Absent means "from the newest".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_sequence: Option<u64>,

    /// Maximum number of messages to return. Clamped by the server.
    pub limit: u32,
}

/// Page of room history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Messages in descending sequence order. Tombstoned messages are
    /// excluded, so pages may be shorter than the requested limit even
    /// when older history exists.
    pub messages: Vec<MessageRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_matches_authority() {
        assert!(Role::Member < Role::Moderator);
        assert!(Role::Moderator < Role::Admin);
        assert!(Role::Admin >= Role::Moderator);
    }

    #[test]
    fn message_record_round_trip() {
        let original = MessageRecord {
            id: 42,
            sender_id: 7,
            sequence: 3,
            kind: MessageKind::Text,
            content: "hello".to_string(),
            reply_to: Some(41),
            mentions: vec![9, 12],
            created_at_ms: 1_700_000_000_000,
        };

        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&original, &mut encoded).unwrap();
        let decoded: MessageRecord = ciborium::de::from_reader(&encoded[..]).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn message_record_empty_mentions_round_trip() {
        let original = MessageRecord {
            id: 1,
            sender_id: 2,
            sequence: 1,
            kind: MessageKind::Image,
            content: "https://cdn.example/img.png".to_string(),
            reply_to: None,
            mentions: Vec::new(),
            created_at_ms: 0,
        };

        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&original, &mut encoded).unwrap();
        let decoded: MessageRecord = ciborium::de::from_reader(&encoded[..]).unwrap();

        assert_eq!(original, decoded);
    }
}
