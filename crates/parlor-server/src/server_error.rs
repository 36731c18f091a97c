//! Server error types.
//!
//! One hand-written enum covers the runtime: configuration and transport
//! faults, protocol violations, and wrapped domain errors from the room
//! router and the storage backend. Doc comments distinguish transient
//! conditions from fatal ones. At the wire boundary every rejection is
//! converted into an [`ErrorPayload`] with a stable numeric code.

use std::fmt;

use parlor_core::RoomError;
use parlor_proto::ErrorPayload;

use crate::storage::StorageError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, missing TLS certs, etc.).
    ///
    /// These are fatal errors that prevent server startup. Fix configuration
    /// and restart.
    Config(String),

    /// Transport/network error (connection failure, I/O error, etc.).
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    /// Check error message for details.
    Transport(String),

    /// Protocol error (invalid frame format, unsupported version, etc.).
    ///
    /// Indicates a client sent malformed data. Fatal for that connection,
    /// but the server keeps serving other clients.
    Protocol(String),

    /// Room command rejected by the room router.
    ///
    /// See [`RoomError`] for cause and retryability. Reported to the client,
    /// never fatal for the connection.
    Room(RoomError),

    /// Storage operation failed.
    ///
    /// Wraps errors from the storage backend. May be transient (I/O errors)
    /// or fatal (serialization errors).
    Storage(StorageError),

    /// Session not found in registry.
    ///
    /// Occurs when sending to a session that has already disconnected.
    /// Transient - the frame is dropped and the client can reconnect.
    SessionNotFound(u64),

    /// A room worker's command channel is full.
    ///
    /// Backpressure signal. Transient - the client should retry shortly.
    RoomBusy(u128),

    /// Internal error (unexpected state, logic bug, etc.).
    ///
    /// Should never happen in a correct implementation. Indicates a bug.
    Internal(String),
}

impl ServerError {
    /// Wire payload for this error, with its stable numeric code.
    pub fn to_error_payload(&self) -> ErrorPayload {
        match self {
            Self::Config(msg) | Self::Internal(msg) => ErrorPayload::protocol(msg.clone()),
            Self::Transport(msg) => ErrorPayload::protocol(format!("transport: {msg}")),
            Self::Protocol(msg) => ErrorPayload::protocol(msg.clone()),
            Self::Room(err) => room_error_payload(err),
            Self::Storage(err) => ErrorPayload::persistence(err.to_string()),
            Self::SessionNotFound(id) => {
                ErrorPayload::protocol(format!("session not found: {id}"))
            },
            Self::RoomBusy(_) => ErrorPayload::overloaded(),
        }
    }
}

/// Maps a room rejection onto its wire payload.
///
/// The code taxonomy is a stable contract: clients branch on the code, not
/// the message.
pub fn room_error_payload(err: &RoomError) -> ErrorPayload {
    match err {
        RoomError::UnknownRoom(room_id) => ErrorPayload::unknown_room(*room_id),
        RoomError::NotAMember { .. } => ErrorPayload {
            code: ErrorPayload::NOT_A_MEMBER,
            message: err.to_string(),
            retry_after: None,
        },
        RoomError::Capacity { .. } => ErrorPayload {
            code: ErrorPayload::CAPACITY,
            message: err.to_string(),
            retry_after: None,
        },
        RoomError::Restricted { reason, retry_after } => {
            ErrorPayload::restricted(reason.clone(), *retry_after)
        },
        RoomError::Unauthorized(msg) => ErrorPayload::unauthorized(msg.clone()),
        RoomError::UnknownMessage(message_id) => ErrorPayload::unknown_message(*message_id),
        RoomError::Malformed(msg) => ErrorPayload::malformed(msg.clone()),
        RoomError::SequenceOverflow(_) | RoomError::Persistence(_) => {
            ErrorPayload::persistence(err.to_string())
        },
        RoomError::Internal(msg) => ErrorPayload::protocol(msg.clone()),
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Room(err) => write!(f, "room error: {err}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::RoomBusy(room_id) => write!(f, "room {room_id:032x} worker busy"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Room(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RoomError> for ServerError {
    fn from(err: RoomError) -> Self {
        Self::Room(err)
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<parlor_proto::ProtocolError> for ServerError {
    fn from(err: parlor_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_rejections_map_to_stable_codes() {
        let cases = [
            (RoomError::UnknownRoom(7), ErrorPayload::UNKNOWN_ROOM),
            (RoomError::NotAMember { user_id: 3 }, ErrorPayload::NOT_A_MEMBER),
            (RoomError::Capacity { capacity: 2 }, ErrorPayload::CAPACITY),
            (
                RoomError::Restricted { reason: "muted".to_string(), retry_after: Some(30) },
                ErrorPayload::RESTRICTED,
            ),
            (RoomError::Unauthorized("role".to_string()), ErrorPayload::UNAUTHORIZED),
            (RoomError::UnknownMessage(9), ErrorPayload::UNKNOWN_MESSAGE),
            (RoomError::Malformed("empty".to_string()), ErrorPayload::MALFORMED),
            (RoomError::SequenceOverflow(7), ErrorPayload::PERSISTENCE),
            (RoomError::Persistence("disk".to_string()), ErrorPayload::PERSISTENCE),
        ];

        for (err, code) in cases {
            assert_eq!(room_error_payload(&err).code, code, "{err}");
        }
    }

    #[test]
    fn timed_restriction_carries_retry_after() {
        let err = RoomError::Restricted { reason: "muted: spam".to_string(), retry_after: Some(120) };
        let payload = room_error_payload(&err);
        assert_eq!(payload.retry_after, Some(120));
        assert_eq!(payload.message, "muted: spam");
    }

    #[test]
    fn busy_room_maps_to_overload() {
        let payload = ServerError::RoomBusy(1).to_error_payload();
        assert_eq!(payload.code, ErrorPayload::OVERLOADED);
        assert_eq!(payload.retry_after, Some(1));
    }
}
