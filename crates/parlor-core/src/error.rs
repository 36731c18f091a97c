//! Error types for connection and room state machines.

use std::time::Duration;

use parlor_proto::ProtocolError;

use crate::connection::ConnectionState;

/// Errors that can occur during connection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Operation attempted in invalid connection state.
    #[error("invalid state for operation: {state:?} cannot {operation}")]
    InvalidState {
        /// Current connection state.
        state: ConnectionState,
        /// Operation that was attempted.
        operation: String,
    },

    /// Received unexpected frame for current state.
    #[error("unexpected frame in state {state:?}: opcode {opcode:#06x}")]
    UnexpectedFrame {
        /// Current connection state.
        state: ConnectionState,
        /// Received opcode.
        opcode: u16,
    },

    /// Handshake did not complete within timeout.
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// Time elapsed since connection start.
        elapsed: Duration,
    },

    /// Connection idle too long.
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// Time since last activity.
        elapsed: Duration,
    },

    /// Frame payload invalid for opcode.
    #[error("invalid payload for opcode {opcode:#06x}: expected {expected}")]
    InvalidPayload {
        /// Expected payload type.
        expected: &'static str,
        /// Frame opcode.
        opcode: u16,
    },

    /// Protocol-level error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Whether this error is transient (the peer may usefully reconnect).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::IdleTimeout { .. })
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<ConnectionError> for std::io::Error {
    fn from(err: ConnectionError) -> Self {
        std::io::Error::other(err.to_string())
    }
}

/// Errors produced while processing room commands.
///
/// Each variant corresponds to a wire error code, so the server can reject a
/// command with a payload the client can act on. Construction happens in the
/// domain trackers and the room router; the transport never invents these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Room does not exist.
    #[error("unknown room {0:#x}")]
    UnknownRoom(u128),

    /// Sender is not a member of the room.
    #[error("user {user_id} is not a member")]
    NotAMember {
        /// User that attempted the operation.
        user_id: u64,
    },

    /// Room is at member capacity.
    #[error("room is full (capacity {capacity})")]
    Capacity {
        /// Configured member limit.
        capacity: u32,
    },

    /// Sender is muted or banned.
    #[error("restricted: {reason}")]
    Restricted {
        /// Human-readable restriction summary.
        reason: String,
        /// Seconds until the restriction expires, if timed.
        retry_after: Option<u64>,
    },

    /// Sender's role does not permit the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced message does not exist in the room.
    #[error("unknown message {0}")]
    UnknownMessage(u64),

    /// Command payload failed validation.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// Room sequence counter exhausted.
    #[error("sequence overflow in room {0:#x}")]
    SequenceOverflow(u128),

    /// Storage backend failed; the command was not applied.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Server-side processing failure unrelated to the command itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Whether retrying the same command may succeed without any other change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
