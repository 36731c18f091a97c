//! Moderation payload types.
//!
//! A single `Moderate` request covers every action kind; `DeleteMessage` is
//! a dedicated shorthand that the server routes through the same enforcer
//! path. Role changes use their own `ChangeRole` request because they gate
//! on `Admin` and mutate the membership record rather than creating a
//! restriction.

use serde::{Deserialize, Serialize};

use super::room::Role;

/// Moderation action category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModerationKind {
    /// Advisory notice to the target; no restriction created.
    Warn,
    /// Block the target's sends in this room for the duration.
    Mute,
    /// Remove the target from the room one-shot; re-join is allowed.
    Kick,
    /// Remove the target and block re-join for the duration (or forever
    /// when no duration is given).
    Ban,
    /// Deactivate the target's active restriction before its expiry.
    Lift,
    /// Tombstone a message.
    DeleteMessage,
}

/// Apply a moderation action
///
/// Authorization: `Warn`/`Mute`/`Kick`/`DeleteMessage`/`Lift` and timed
/// `Ban` require actor role ≥ `Moderator` in the room; a permanent `Ban`
/// (no duration) requires `Admin`. Accepted actions produce an audit entry
/// and a `ModerationEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moderate {
    /// Action to apply.
    pub kind: ModerationKind,

    /// Target user, for user-directed kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<u64>,

    /// Target message, for `DeleteMessage`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_message: Option<u64>,

    /// Reason recorded in the audit log and shown to the target.
    pub reason: String,

    /// Restriction window for `Mute`/`Ban`. Absent means permanent.
    /// Ignored for one-shot kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Tombstone a message
///
/// Shorthand for `Moderate { kind: DeleteMessage, .. }`. Idempotent:
/// deleting an already-tombstoned message is still `Applied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessage {
    /// Message to tombstone.
    pub message_id: u64,
}

/// Change a member's role
///
/// Requires actor role `Admin` in the room. The membership record is the
/// single role authority; every later permission check sees the new role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRole {
    /// Member whose role changes.
    pub user_id: u64,
    /// New role.
    pub role: Role,
}

/// Role change fanned out to room members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEvent {
    /// Member whose role changed.
    pub user_id: u64,
    /// New role.
    pub role: Role,
}

/// Query the room's moderation audit log (client to server)
///
/// Requires actor role ≥ `Moderator`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationLog {
    /// Maximum number of entries to return, newest first. Clamped by the
    /// server; absent means the server default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Action that was applied.
    pub kind: ModerationKind,

    /// Acting moderator or admin.
    pub actor: u64,

    /// Target user, when user-directed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<u64>,

    /// Target message, when message-directed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_message: Option<u64>,

    /// Recorded reason.
    pub reason: String,

    /// Server wall clock when the action was accepted, Unix milliseconds.
    pub issued_at_ms: u64,

    /// Restriction window, when timed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Audit log response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationLogResponse {
    /// Entries, newest first.
    pub entries: Vec<AuditEntry>,
}

/// Moderation action fanned out to affected parties
///
/// Kicks, bans, and deletions are visible to the whole room; warns and
/// mutes are delivered to the target only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationEvent {
    /// Action that was applied.
    pub kind: ModerationKind,

    /// Acting moderator or admin.
    pub actor: u64,

    /// Target user, when user-directed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<u64>,

    /// Target message, when message-directed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_message: Option<u64>,

    /// Recorded reason.
    pub reason: String,

    /// Restriction window, when timed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
