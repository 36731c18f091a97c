//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary for routing speed, but payloads use CBOR
//! for type safety and forward compatibility. The `Payload` enum covers all
//! message types: session management, room lifecycle, messaging, presence,
//! reactions and receipts, moderation, and notifications.
//!
//! CBOR is self-describing (field names embedded), compact, and needs no
//! code generation. The server deserializes client payloads at the driver
//! boundary; event payloads it produces itself are encoded once and fanned
//! out as raw frames.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Round-trip encoding must produce identical values.

pub mod moderation;
pub mod notify;
pub mod presence;
pub mod reactions;
pub mod room;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// The payload type is determined by the `Opcode` in the frame header, so
/// we serialize only the inner struct content (no variant tag in CBOR).
///
/// # Invariants
///
/// - Opcode Uniqueness: Each payload variant corresponds to exactly one
///   `Opcode`; `opcode()` returns a unique opcode per variant.
///
/// - No Variant Tag: the variant discriminator is NOT serialized. The frame
///   header's `opcode` field already identifies the payload type, so a peer
///   cannot send mismatched opcode/payload pairs.
///
/// - Exhaustive Matching: all methods use exhaustive `match` statements.
///   Adding a variant breaks `encode()`, `decode()`, and `opcode()` until
///   it is handled everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session management
    /// Initial handshake with credential token.
    Hello(session::Hello),
    /// Server response to a successful Hello.
    Welcome(session::Welcome),
    /// Graceful disconnect.
    Goodbye(session::Goodbye),
    /// Ping for keepalive.
    Ping,
    /// Pong response.
    Pong,
    /// Acknowledgment of an accepted mutation.
    Ack(session::Ack),
    /// Error response.
    Error(ErrorPayload),

    // Room lifecycle
    /// Create a room definition.
    CreateRoom(room::CreateRoom),
    /// Join a room (room id in header, no body).
    JoinRoom,
    /// Leave a room (room id in header, no body).
    LeaveRoom,
    /// Add a user to a private room's allow list.
    Invite(room::Invite),
    /// Request a page of room history.
    HistoryRequest(room::HistoryRequest),
    /// Page of room history.
    HistoryResponse(room::HistoryResponse),

    // Messaging
    /// Send a message to a room.
    RoomMessage(room::RoomMessage),
    /// Send a message to a single recipient.
    DirectMessage(room::DirectMessage),
    /// Accepted message fanned out to room members.
    RoomMessageEvent(room::MessageRecord),
    /// A user joined the room.
    MemberJoined(room::MemberJoined),
    /// A user left the room.
    MemberLeft(room::MemberLeft),

    // Presence and typing
    /// Typing indicator for a room.
    Typing(presence::Typing),
    /// Typing indicator for a direct conversation.
    TypingDm(presence::TypingDm),
    /// Typing state change fanned out to room members.
    TypingEvent(presence::TypingEvent),
    /// Explicit presence status change.
    ChangeStatus(presence::ChangeStatus),
    /// Presence transition fanned out to interested users.
    PresenceEvent(presence::PresenceEvent),

    // Reactions and receipts
    /// Toggle an emoji reaction on a message.
    ToggleReaction(reactions::ToggleReaction),
    /// Reaction diff fanned out to room members.
    ReactionEvent(reactions::ReactionEvent),
    /// Mark a message as read.
    MarkRead(reactions::MarkRead),
    /// Read receipt routed to the message author.
    ReceiptEvent(reactions::ReceiptEvent),
    /// Query the reader list of an authored message.
    ReadList(reactions::ReadList),
    /// Reader list response.
    ReadListResponse(reactions::ReadListResponse),

    // Moderation
    /// Apply a moderation action.
    Moderate(moderation::Moderate),
    /// Tombstone a message.
    DeleteMessage(moderation::DeleteMessage),
    /// Change a member's role.
    ChangeRole(moderation::ChangeRole),
    /// Role change fanned out to room members.
    RoleEvent(moderation::RoleEvent),
    /// Query the room's moderation audit log.
    ModerationLog(moderation::ModerationLog),
    /// Audit log response.
    ModerationLogResponse(moderation::ModerationLogResponse),
    /// Moderation action fanned out to the room or target.
    ModerationEvent(moderation::ModerationEvent),

    // Notifications
    /// Mention/reply/system notification to a single user.
    NotificationEvent(notify::NotificationEvent),
}

/// Error payload for error frames.
///
/// Codes are stable wire contract: clients branch on `code`, never on
/// `message`. `retry_after` is set for timed restrictions and transient
/// overload so clients can back off precisely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// Optional retry-after duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorPayload {
    /// Credential token invalid or expired; no session established.
    pub const AUTH_FAILED: u16 = 0x0001;
    /// Operation on a room the caller has not joined.
    pub const NOT_A_MEMBER: u16 = 0x0002;
    /// Room is at capacity.
    pub const CAPACITY: u16 = 0x0003;
    /// An active mute or ban blocks the operation.
    pub const RESTRICTED: u16 = 0x0004;
    /// Actor role is insufficient for the operation.
    pub const UNAUTHORIZED: u16 = 0x0005;
    /// The store rejected the write; transient, retry later.
    pub const PERSISTENCE: u16 = 0x0006;
    /// Payload failed validation.
    pub const MALFORMED: u16 = 0x0007;
    /// Room does not exist.
    pub const UNKNOWN_ROOM: u16 = 0x0008;
    /// Message does not exist.
    pub const UNKNOWN_MESSAGE: u16 = 0x0009;
    /// Server-side overload; transient, retry later.
    pub const OVERLOADED: u16 = 0x000A;
    /// Frame violated the protocol state machine.
    pub const PROTOCOL: u16 = 0x000B;

    /// Create an authentication failure error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self { code: Self::AUTH_FAILED, message: msg.into(), retry_after: None }
    }

    /// Create a not-a-member error.
    pub fn not_a_member(room_id: u128) -> Self {
        Self {
            code: Self::NOT_A_MEMBER,
            message: format!("not a member of room {room_id:032x}"),
            retry_after: None,
        }
    }

    /// Create a room-at-capacity error.
    pub fn capacity(room_id: u128) -> Self {
        Self {
            code: Self::CAPACITY,
            message: format!("room {room_id:032x} is full"),
            retry_after: None,
        }
    }

    /// Create a restriction error. `retry_after` carries the remaining
    /// restriction window in seconds for timed restrictions.
    pub fn restricted(msg: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self { code: Self::RESTRICTED, message: msg.into(), retry_after }
    }

    /// Create an insufficient-role error.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self { code: Self::UNAUTHORIZED, message: msg.into(), retry_after: None }
    }

    /// Create a persistence failure error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self { code: Self::PERSISTENCE, message: msg.into(), retry_after: Some(1) }
    }

    /// Create a malformed payload error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self { code: Self::MALFORMED, message: msg.into(), retry_after: None }
    }

    /// Create an unknown room error.
    pub fn unknown_room(room_id: u128) -> Self {
        Self {
            code: Self::UNKNOWN_ROOM,
            message: format!("room not found: {room_id:032x}"),
            retry_after: None,
        }
    }

    /// Create an unknown message error.
    pub fn unknown_message(message_id: u64) -> Self {
        Self {
            code: Self::UNKNOWN_MESSAGE,
            message: format!("message not found: {message_id}"),
            retry_after: None,
        }
    }

    /// Create a transient overload error.
    pub fn overloaded() -> Self {
        Self {
            code: Self::OVERLOADED,
            message: "server overloaded, retry".to_string(),
            retry_after: Some(1),
        }
    }

    /// Create a protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self { code: Self::PROTOCOL, message: msg.into(), retry_after: None }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::Welcome(_) => Opcode::Welcome,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::Ack(_) => Opcode::Ack,
            Self::Error(_) => Opcode::Error,
            Self::CreateRoom(_) => Opcode::CreateRoom,
            Self::JoinRoom => Opcode::JoinRoom,
            Self::LeaveRoom => Opcode::LeaveRoom,
            Self::Invite(_) => Opcode::Invite,
            Self::HistoryRequest(_) => Opcode::HistoryRequest,
            Self::HistoryResponse(_) => Opcode::HistoryResponse,
            Self::RoomMessage(_) => Opcode::RoomMessage,
            Self::DirectMessage(_) => Opcode::DirectMessage,
            Self::RoomMessageEvent(_) => Opcode::RoomMessageEvent,
            Self::MemberJoined(_) => Opcode::MemberJoined,
            Self::MemberLeft(_) => Opcode::MemberLeft,
            Self::Typing(_) => Opcode::Typing,
            Self::TypingDm(_) => Opcode::TypingDm,
            Self::TypingEvent(_) => Opcode::TypingEvent,
            Self::ChangeStatus(_) => Opcode::ChangeStatus,
            Self::PresenceEvent(_) => Opcode::PresenceEvent,
            Self::ToggleReaction(_) => Opcode::ToggleReaction,
            Self::ReactionEvent(_) => Opcode::ReactionEvent,
            Self::MarkRead(_) => Opcode::MarkRead,
            Self::ReceiptEvent(_) => Opcode::ReceiptEvent,
            Self::ReadList(_) => Opcode::ReadList,
            Self::ReadListResponse(_) => Opcode::ReadListResponse,
            Self::Moderate(_) => Opcode::Moderate,
            Self::DeleteMessage(_) => Opcode::DeleteMessage,
            Self::ChangeRole(_) => Opcode::ChangeRole,
            Self::RoleEvent(_) => Opcode::RoleEvent,
            Self::ModerationLog(_) => Opcode::ModerationLog,
            Self::ModerationLogResponse(_) => Opcode::ModerationLogResponse,
            Self::ModerationEvent(_) => Opcode::ModerationEvent,
            Self::NotificationEvent(_) => Opcode::NotificationEvent,
        }
    }

    /// Encode payload to buffer.
    ///
    /// Serializes only the inner struct, NOT the variant tag. The frame
    /// header's opcode already identifies the payload type. Size limits
    /// are enforced later by [`Frame::encode`], not here.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Welcome(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ping | Self::Pong | Self::JoinRoom | Self::LeaveRoom => Ok(()), // Zero-byte payloads
            Self::Ack(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::CreateRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Invite(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HistoryRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HistoryResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RoomMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::DirectMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RoomMessageEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::MemberJoined(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::MemberLeft(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Typing(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::TypingDm(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::TypingEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ChangeStatus(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::PresenceEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ToggleReaction(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReactionEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::MarkRead(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReceiptEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReadList(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReadListResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Moderate(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::DeleteMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ChangeRole(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RoleEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ModerationLog(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ModerationLogResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ModerationEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::NotificationEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode.
    ///
    /// The size check happens BEFORE CBOR parsing begins, so the parser
    /// never processes oversized input. Unknown opcodes are rejected rather
    /// than silently ignored.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed the cap
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::UnknownOpcode` if opcode is not recognized
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        fn read<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(read(bytes)?),
            Opcode::Welcome => Self::Welcome(read(bytes)?),
            Opcode::Goodbye => Self::Goodbye(read(bytes)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::Ack => Self::Ack(read(bytes)?),
            Opcode::Error => Self::Error(read(bytes)?),
            Opcode::CreateRoom => Self::CreateRoom(read(bytes)?),
            Opcode::JoinRoom => Self::JoinRoom,
            Opcode::LeaveRoom => Self::LeaveRoom,
            Opcode::Invite => Self::Invite(read(bytes)?),
            Opcode::HistoryRequest => Self::HistoryRequest(read(bytes)?),
            Opcode::HistoryResponse => Self::HistoryResponse(read(bytes)?),
            Opcode::RoomMessage => Self::RoomMessage(read(bytes)?),
            Opcode::DirectMessage => Self::DirectMessage(read(bytes)?),
            Opcode::RoomMessageEvent => Self::RoomMessageEvent(read(bytes)?),
            Opcode::MemberJoined => Self::MemberJoined(read(bytes)?),
            Opcode::MemberLeft => Self::MemberLeft(read(bytes)?),
            Opcode::Typing => Self::Typing(read(bytes)?),
            Opcode::TypingDm => Self::TypingDm(read(bytes)?),
            Opcode::TypingEvent => Self::TypingEvent(read(bytes)?),
            Opcode::ChangeStatus => Self::ChangeStatus(read(bytes)?),
            Opcode::PresenceEvent => Self::PresenceEvent(read(bytes)?),
            Opcode::ToggleReaction => Self::ToggleReaction(read(bytes)?),
            Opcode::ReactionEvent => Self::ReactionEvent(read(bytes)?),
            Opcode::MarkRead => Self::MarkRead(read(bytes)?),
            Opcode::ReceiptEvent => Self::ReceiptEvent(read(bytes)?),
            Opcode::ReadList => Self::ReadList(read(bytes)?),
            Opcode::ReadListResponse => Self::ReadListResponse(read(bytes)?),
            Opcode::Moderate => Self::Moderate(read(bytes)?),
            Opcode::DeleteMessage => Self::DeleteMessage(read(bytes)?),
            Opcode::ChangeRole => Self::ChangeRole(read(bytes)?),
            Opcode::RoleEvent => Self::RoleEvent(read(bytes)?),
            Opcode::ModerationLog => Self::ModerationLog(read(bytes)?),
            Opcode::ModerationLogResponse => Self::ModerationLogResponse(read(bytes)?),
            Opcode::ModerationEvent => Self::ModerationEvent(read(bytes)?),
            Opcode::NotificationEvent => Self::NotificationEvent(read(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame.
    ///
    /// Encodes the payload to CBOR bytes, stamps the matching opcode into
    /// the header, and builds a Frame with automatic `payload_size`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is unknown
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::PayloadTooLarge` if payload exceeds the cap
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_ping_round_trip() {
        let payload = Payload::Ping;

        let header = FrameHeader::new(Opcode::Ping);
        let frame = payload.clone().into_frame(header).expect("should create frame");
        assert_eq!(frame.payload.len(), 0);

        let decoded = Payload::from_frame(&frame).expect("should parse payload");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn payload_join_room_is_zero_byte() {
        let payload = Payload::JoinRoom;

        let mut header = FrameHeader::new(Opcode::JoinRoom);
        header.set_room_id(55);
        let frame = payload.clone().into_frame(header).expect("should create frame");
        assert_eq!(frame.payload.len(), 0);
        assert_eq!(frame.header.room_id(), 55);

        let decoded = Payload::from_frame(&frame).expect("should parse payload");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn payload_error_round_trip() {
        let payload = Payload::Error(ErrorPayload {
            code: 0x00FF,
            message: "Test error".to_string(),
            retry_after: Some(30),
        });

        let header = FrameHeader::new(Opcode::Error);
        let frame = payload.clone().into_frame(header).expect("should create frame");
        let decoded = Payload::from_frame(&frame).expect("should parse payload");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn into_frame_overrides_header_opcode() {
        // Header starts with a mismatched opcode; into_frame must stamp the
        // payload's own opcode.
        let header = FrameHeader::new(Opcode::Ping);
        let payload = Payload::MarkRead(reactions::MarkRead { message_id: 3 });

        let frame = payload.into_frame(header).expect("should create frame");
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::MarkRead));
    }

    #[test]
    fn restricted_error_carries_retry_after() {
        let err = ErrorPayload::restricted("muted in this room", Some(120));
        assert_eq!(err.code, ErrorPayload::RESTRICTED);
        assert_eq!(err.retry_after, Some(120));
    }
}
