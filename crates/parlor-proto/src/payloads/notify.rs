//! Notification payload types.
//!
//! Notifications are delivered live to the recipient's sessions and are not
//! persisted by this server; the platform's notification store is a
//! separate collaborator. The read flag therefore lives client-side.

use serde::{Deserialize, Serialize};

/// Notification category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Someone mentioned the recipient with `@username`.
    Mention,
    /// Someone reacted to the recipient's message.
    Reaction,
    /// Someone replied to the recipient's message.
    Reply,
    /// Someone shared a file addressed to the recipient.
    FileShare,
    /// A moderation action targeted the recipient.
    Moderation,
    /// Server-originated notice.
    System,
}

/// Notification to a single user
///
/// The source room travels in the frame header's `room_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Server-assigned notification id.
    pub id: u64,

    /// Notification category.
    pub kind: NotificationKind,

    /// User whose action caused the notification.
    pub actor: u64,

    /// Source message, when the notification references one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,

    /// Short content excerpt for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,

    /// Server wall clock, Unix milliseconds.
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_round_trip() {
        let original = NotificationEvent {
            id: 71,
            kind: NotificationKind::Mention,
            actor: 4,
            message_id: Some(900),
            preview: Some("@bob see this".to_string()),
            created_at_ms: 1_700_000_000_000,
        };

        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&original, &mut encoded).unwrap();
        let decoded: NotificationEvent = ciborium::de::from_reader(&encoded[..]).unwrap();

        assert_eq!(original, decoded);
    }
}
