//! Session management payload types.
//!
//! These payloads cover the connection handshake, keepalive, graceful
//! shutdown, and the generic acknowledgment returned for accepted
//! mutations.

use serde::{Deserialize, Serialize};

use super::room::Role;

/// Initial handshake
///
/// First frame a client must send. Carries the credential token issued by
/// the platform's auth service; the server verifies it and answers with
/// [`Welcome`] or an `Error` frame with code `AUTH_FAILED`.
///
/// A second Hello on an already-authenticated connection is a protocol
/// violation and closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Opaque credential token. Validated by the server's authenticator;
    /// never interpreted by the protocol layer.
    pub token: String,

    /// Optional client build identifier, used for logging only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

/// Server response to a successful Hello
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Authenticated user id the connection is now bound to.
    pub user_id: u64,

    /// Server-assigned session id for this connection.
    pub session_id: u64,

    /// Interval at which the client should send `Ping`, in milliseconds.
    /// Connections idle for roughly three intervals are closed.
    pub heartbeat_interval_ms: u64,
}

/// Graceful disconnect
///
/// Sent by either side before closing the transport. Cleanup is identical
/// to an abrupt transport loss; the frame only makes the close intentional
/// in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Optional human-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Server acknowledgment of an accepted mutation
///
/// The frame header echoes the client's `request_id` (submission token), so
/// the client reconciles its optimistic local entry by token rather than by
/// guessing server-assigned ids. For direct-message sends the Ack frame's
/// header additionally carries the synthesized direct room id.
///
/// Fields are populated per operation; absent fields are omitted from the
/// CBOR encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Canonical message id assigned by the store (message sends).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,

    /// Room sequence number assigned by the router (message sends).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    /// Role granted to the joining user (joins).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Ack {
    /// Acknowledgment with no result data (leave, typing, moderation, ...).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Acknowledgment for an accepted message.
    #[must_use]
    pub fn message(message_id: u64, sequence: u64) -> Self {
        Self { message_id: Some(message_id), sequence: Some(sequence), role: None }
    }

    /// Acknowledgment for a successful join.
    #[must_use]
    pub fn joined(role: Role) -> Self {
        Self { message_id: None, sequence: None, role: Some(role) }
    }
}
