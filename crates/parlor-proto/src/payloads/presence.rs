//! Presence and typing payload types.
//!
//! Both concerns are ephemeral: never persisted, no ordering guarantee
//! relative to messages.

use serde::{Deserialize, Serialize};

/// Aggregated presence status across all of a user's live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    /// At least one live connection, no override set.
    Online,
    /// Explicit override while connected.
    Away,
    /// Explicit override while connected.
    Busy,
    /// No live connections.
    Offline,
}

/// Typing indicator for a room (client to server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    /// True while composing; auto-reverts server-side after the typing
    /// idle timeout without a further update.
    pub active: bool,
}

/// Typing indicator for a direct conversation (client to server).
///
/// The recipient user id travels in the frame header's `context_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingDm {
    /// True while composing.
    pub active: bool,
}

/// Typing state change fanned out to room members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// User whose typing state changed.
    pub user_id: u64,
    /// New state.
    pub active: bool,
}

/// Explicit presence status change (client to server).
///
/// `Away` and `Busy` set a user-level override that persists across that
/// user's reconnects until changed again or until the user goes offline.
/// `Online` clears the override. `Offline` is derived, never requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    /// Requested status.
    pub status: PresenceStatus,
}

/// Presence transition fanned out to users sharing a room with the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// User whose presence changed.
    pub user_id: u64,
    /// New aggregated status.
    pub status: PresenceStatus,
    /// Server wall clock of the transition, Unix milliseconds.
    pub last_active_ms: u64,
}
