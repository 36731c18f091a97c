//! Operation codes identifying frame payload types.
//!
//! Opcodes are grouped by concern: session management (0x000x), room
//! lifecycle (0x001x), messaging (0x002x), presence and typing (0x003x),
//! reactions and receipts (0x004x), moderation (0x005x), notifications
//! (0x006x). Each opcode maps to exactly one payload type; the pairing is
//! enforced by `Payload::opcode()` match exhaustiveness.

/// Frame operation code.
///
/// Stored as a `u16` in the frame header. Client-originated opcodes carry a
/// nonzero `request_id` that the server echoes in the matching `Ack` or
/// `Error`; server-originated events carry `request_id` 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Session management
    /// Initial handshake carrying the credential token.
    Hello = 0x0001,
    /// Server response to a successful Hello.
    Welcome = 0x0002,
    /// Graceful disconnect from either side.
    Goodbye = 0x0003,
    /// Keepalive probe.
    Ping = 0x0004,
    /// Keepalive response.
    Pong = 0x0005,
    /// Server acknowledgment of an accepted mutation.
    Ack = 0x0006,
    /// Server rejection of a request.
    Error = 0x0007,

    // Room lifecycle
    /// Create a room definition.
    CreateRoom = 0x0010,
    /// Join a room.
    JoinRoom = 0x0011,
    /// Leave a room.
    LeaveRoom = 0x0012,
    /// Add a user to a private room's allow list.
    Invite = 0x0013,
    /// Request a page of room history.
    HistoryRequest = 0x0014,
    /// Page of room history.
    HistoryResponse = 0x0015,

    // Messaging
    /// Send a message to a room.
    RoomMessage = 0x0020,
    /// Send a message to a single recipient.
    DirectMessage = 0x0021,
    /// Accepted message fanned out to room members.
    RoomMessageEvent = 0x0022,
    /// A user joined the room.
    MemberJoined = 0x0023,
    /// A user left the room.
    MemberLeft = 0x0024,

    // Presence and typing
    /// Typing indicator for a room.
    Typing = 0x0030,
    /// Typing indicator for a direct conversation.
    TypingDm = 0x0031,
    /// Typing state change fanned out to room members.
    TypingEvent = 0x0032,
    /// Explicit presence status change (away/busy/online).
    ChangeStatus = 0x0033,
    /// Presence transition fanned out to interested users.
    PresenceEvent = 0x0034,

    // Reactions and receipts
    /// Toggle an emoji reaction on a message.
    ToggleReaction = 0x0040,
    /// Reaction diff fanned out to room members.
    ReactionEvent = 0x0041,
    /// Mark a message as read.
    MarkRead = 0x0042,
    /// Read receipt routed to the message author.
    ReceiptEvent = 0x0043,
    /// Query the reader list of an authored message.
    ReadList = 0x0044,
    /// Reader list response.
    ReadListResponse = 0x0045,

    // Moderation
    /// Apply a moderation action (warn/mute/kick/ban/lift/delete).
    Moderate = 0x0050,
    /// Tombstone a message.
    DeleteMessage = 0x0051,
    /// Change a member's role.
    ChangeRole = 0x0052,
    /// Role change fanned out to room members.
    RoleEvent = 0x0053,
    /// Query the room's moderation audit log.
    ModerationLog = 0x0054,
    /// Audit log response.
    ModerationLogResponse = 0x0055,
    /// Moderation action fanned out to the room or target.
    ModerationEvent = 0x0056,

    // Notifications
    /// Mention/reply/system notification to a single user.
    NotificationEvent = 0x0060,
}

impl Opcode {
    /// Convert to wire representation.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse from wire representation. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::Welcome),
            0x0003 => Some(Self::Goodbye),
            0x0004 => Some(Self::Ping),
            0x0005 => Some(Self::Pong),
            0x0006 => Some(Self::Ack),
            0x0007 => Some(Self::Error),
            0x0010 => Some(Self::CreateRoom),
            0x0011 => Some(Self::JoinRoom),
            0x0012 => Some(Self::LeaveRoom),
            0x0013 => Some(Self::Invite),
            0x0014 => Some(Self::HistoryRequest),
            0x0015 => Some(Self::HistoryResponse),
            0x0020 => Some(Self::RoomMessage),
            0x0021 => Some(Self::DirectMessage),
            0x0022 => Some(Self::RoomMessageEvent),
            0x0023 => Some(Self::MemberJoined),
            0x0024 => Some(Self::MemberLeft),
            0x0030 => Some(Self::Typing),
            0x0031 => Some(Self::TypingDm),
            0x0032 => Some(Self::TypingEvent),
            0x0033 => Some(Self::ChangeStatus),
            0x0034 => Some(Self::PresenceEvent),
            0x0040 => Some(Self::ToggleReaction),
            0x0041 => Some(Self::ReactionEvent),
            0x0042 => Some(Self::MarkRead),
            0x0043 => Some(Self::ReceiptEvent),
            0x0044 => Some(Self::ReadList),
            0x0045 => Some(Self::ReadListResponse),
            0x0050 => Some(Self::Moderate),
            0x0051 => Some(Self::DeleteMessage),
            0x0052 => Some(Self::ChangeRole),
            0x0053 => Some(Self::RoleEvent),
            0x0054 => Some(Self::ModerationLog),
            0x0055 => Some(Self::ModerationLogResponse),
            0x0056 => Some(Self::ModerationEvent),
            0x0060 => Some(Self::NotificationEvent),
            _ => None,
        }
    }

    /// True for opcodes a client is allowed to send.
    ///
    /// The server closes connections that send server-only opcodes.
    #[must_use]
    pub const fn is_client_opcode(self) -> bool {
        matches!(
            self,
            Self::Hello
                | Self::Goodbye
                | Self::Ping
                | Self::CreateRoom
                | Self::JoinRoom
                | Self::LeaveRoom
                | Self::Invite
                | Self::HistoryRequest
                | Self::RoomMessage
                | Self::DirectMessage
                | Self::Typing
                | Self::TypingDm
                | Self::ChangeStatus
                | Self::ToggleReaction
                | Self::MarkRead
                | Self::ReadList
                | Self::Moderate
                | Self::DeleteMessage
                | Self::ChangeRole
                | Self::ModerationLog
        )
    }

    /// True if the header's `context_id` holds a room sequence number.
    #[must_use]
    pub const fn carries_sequence(self) -> bool {
        matches!(self, Self::RoomMessageEvent)
    }

    /// True if the header's `context_id` holds a target user id.
    #[must_use]
    pub const fn carries_target(self) -> bool {
        matches!(self, Self::DirectMessage | Self::TypingDm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_known_opcodes() {
        let opcodes = [
            Opcode::Hello,
            Opcode::Welcome,
            Opcode::Goodbye,
            Opcode::Ping,
            Opcode::Pong,
            Opcode::Ack,
            Opcode::Error,
            Opcode::CreateRoom,
            Opcode::JoinRoom,
            Opcode::LeaveRoom,
            Opcode::Invite,
            Opcode::HistoryRequest,
            Opcode::HistoryResponse,
            Opcode::RoomMessage,
            Opcode::DirectMessage,
            Opcode::RoomMessageEvent,
            Opcode::MemberJoined,
            Opcode::MemberLeft,
            Opcode::Typing,
            Opcode::TypingDm,
            Opcode::TypingEvent,
            Opcode::ChangeStatus,
            Opcode::PresenceEvent,
            Opcode::ToggleReaction,
            Opcode::ReactionEvent,
            Opcode::MarkRead,
            Opcode::ReceiptEvent,
            Opcode::ReadList,
            Opcode::ReadListResponse,
            Opcode::Moderate,
            Opcode::DeleteMessage,
            Opcode::ChangeRole,
            Opcode::RoleEvent,
            Opcode::ModerationLog,
            Opcode::ModerationLogResponse,
            Opcode::ModerationEvent,
            Opcode::NotificationEvent,
        ];

        for opcode in opcodes {
            assert_eq!(Opcode::from_u16(opcode.to_u16()), Some(opcode));
        }
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(Opcode::from_u16(0xFFFF), None);
        assert_eq!(Opcode::from_u16(0x0008), None);
    }

    #[test]
    fn server_events_are_not_client_opcodes() {
        assert!(!Opcode::Welcome.is_client_opcode());
        assert!(!Opcode::RoomMessageEvent.is_client_opcode());
        assert!(!Opcode::PresenceEvent.is_client_opcode());
        assert!(!Opcode::Error.is_client_opcode());
        assert!(Opcode::Hello.is_client_opcode());
        assert!(Opcode::RoomMessage.is_client_opcode());
    }
}
