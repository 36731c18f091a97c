//! Reaction and read-receipt payload types.

use serde::{Deserialize, Serialize};

/// Toggle an emoji reaction on a message
///
/// Idempotent by construction: if the (message, user, emoji) tuple is
/// currently active the server deactivates it, otherwise it activates it.
/// The outcome travels back in the [`ReactionEvent`] broadcast and the
/// Ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleReaction {
    /// Message being reacted to.
    pub message_id: u64,

    /// Reaction content (e.g. an emoji). Compared byte-exact.
    pub emoji: String,
}

/// Reaction diff fanned out to room members
///
/// Carries the delta, not a snapshot: one user's toggle outcome plus the
/// resulting aggregate count for that (message, emoji) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    /// Message the reaction applies to.
    pub message_id: u64,
    /// User whose toggle produced this diff.
    pub user_id: u64,
    /// Reaction content.
    pub emoji: String,
    /// True if the toggle activated the tuple, false if it deactivated it.
    pub added: bool,
    /// Aggregate active count for (message, emoji) after the toggle.
    pub count: u32,
}

/// Mark a message as read (client to server)
///
/// Append-only; repeated calls for the same (message, user) are no-op
/// acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRead {
    /// Message that was read.
    pub message_id: u64,
}

/// Read receipt routed to the message author
///
/// Receipts are visible to the author only; they are never broadcast
/// room-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    /// Message that was read.
    pub message_id: u64,
    /// Reader.
    pub user_id: u64,
    /// Server wall clock of the first read, Unix milliseconds.
    pub read_at_ms: u64,
}

/// Query the reader list of a message (client to server)
///
/// Only the message author may query; others receive `UNAUTHORIZED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadList {
    /// Message whose readers are requested.
    pub message_id: u64,
}

/// One reader entry in a [`ReadListResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadEntry {
    /// Reader.
    pub user_id: u64,
    /// Server wall clock of the first read, Unix milliseconds.
    pub read_at_ms: u64,
}

/// Reader list response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadListResponse {
    /// Message whose readers are listed.
    pub message_id: u64,
    /// Readers in read order (first reader first).
    pub readers: Vec<ReadEntry>,
}
