//! Room moderation: restrictions, authorization policy, audit trail.
//!
//! Mutes and bans are point-in-time restrictions: a record holds the issue
//! instant and an optional duration, and every enforcement site compares
//! the current clock against the expiry. Nothing is scheduled; an expired
//! restriction simply stops matching, and an explicit lift removes it
//! early.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parlor_proto::payloads::moderation::{AuditEntry, ModerationKind};
use parlor_proto::payloads::room::Role;

use crate::error::RoomError;
use crate::room::UserId;

/// Audit entries retained per room.
pub const MAX_AUDIT_ENTRIES: usize = 256;

/// What an active restriction blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionKind {
    /// Member stays in the room but cannot send.
    Mute,
    /// Membership is revoked and re-join is blocked.
    Ban,
}

/// A mute or ban issued against one user in one room.
#[derive(Debug, Clone)]
pub struct Restriction<I> {
    /// What is blocked.
    pub kind: RestrictionKind,
    /// Moderator or admin that issued it.
    pub actor: UserId,
    /// Reason given by the actor.
    pub reason: String,
    /// When it was issued.
    pub issued_at: I,
    /// How long it lasts. `None` is permanent.
    pub duration: Option<Duration>,
}

impl<I> Restriction<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Whether the restriction still applies at `now`.
    ///
    /// Active strictly while `now < issued_at + duration`; at the boundary
    /// it has lapsed.
    pub fn is_active(&self, now: I) -> bool {
        self.duration.is_none_or(|duration| now - self.issued_at < duration)
    }

    /// Whole seconds until expiry, rounded up. `None` for permanent
    /// restrictions or ones that already lapsed.
    pub fn retry_after_secs(&self, now: I) -> Option<u64> {
        let duration = self.duration?;
        let remaining = duration.checked_sub(now - self.issued_at)?;
        let mut secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs = secs.saturating_add(1);
        }
        Some(secs)
    }

    fn blocked_reason(&self) -> String {
        match self.kind {
            RestrictionKind::Mute => format!("muted: {}", self.reason),
            RestrictionKind::Ban => format!("banned: {}", self.reason),
        }
    }
}

/// Minimum role needed to apply a moderation action.
///
/// A permanent ban is admin-only; everything else, timed bans included,
/// is open to moderators.
pub fn required_role(kind: ModerationKind, duration: Option<Duration>) -> Role {
    match kind {
        ModerationKind::Ban if duration.is_none() => Role::Admin,
        _ => Role::Moderator,
    }
}

/// Moderation state for one room.
///
/// Holds at most one restriction per user (a new one replaces the old)
/// plus a bounded audit trail of every accepted action.
#[derive(Debug)]
pub struct ModerationState<I> {
    restrictions: HashMap<UserId, Restriction<I>>,
    audit: VecDeque<AuditEntry>,
}

impl<I> ModerationState<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Creates an empty state.
    pub fn new() -> Self {
        Self { restrictions: HashMap::new(), audit: VecDeque::new() }
    }

    /// Current restriction against `user_id`, active or not.
    pub fn restriction(&self, user_id: UserId) -> Option<&Restriction<I>> {
        self.restrictions.get(&user_id)
    }

    /// Rejects the send if the user is actively muted or banned.
    ///
    /// # Errors
    ///
    /// Returns `Restricted` with the remaining seconds for timed
    /// restrictions.
    pub fn check_send(&self, user_id: UserId, now: I) -> Result<(), RoomError> {
        match self.restrictions.get(&user_id) {
            Some(restriction) if restriction.is_active(now) => Err(RoomError::Restricted {
                reason: restriction.blocked_reason(),
                retry_after: restriction.retry_after_secs(now),
            }),
            _ => Ok(()),
        }
    }

    /// Rejects the join if the user is actively banned. Mutes do not block
    /// joining.
    ///
    /// # Errors
    ///
    /// Returns `Restricted` with the remaining seconds for timed bans.
    pub fn check_join(&self, user_id: UserId, now: I) -> Result<(), RoomError> {
        match self.restrictions.get(&user_id) {
            Some(restriction)
                if restriction.kind == RestrictionKind::Ban && restriction.is_active(now) =>
            {
                Err(RoomError::Restricted {
                    reason: restriction.blocked_reason(),
                    retry_after: restriction.retry_after_secs(now),
                })
            }
            _ => Ok(()),
        }
    }

    /// Imposes a restriction, replacing any existing one for the user.
    pub fn impose(
        &mut self,
        target: UserId,
        kind: RestrictionKind,
        actor: UserId,
        reason: &str,
        duration: Option<Duration>,
        now: I,
    ) {
        self.restrictions.insert(
            target,
            Restriction { kind, actor, reason: reason.to_string(), issued_at: now, duration },
        );
    }

    /// Removes the restriction against `user_id` before it expires.
    ///
    /// Returns the lifted restriction, or `None` if there was none.
    pub fn lift(&mut self, target: UserId) -> Option<Restriction<I>> {
        self.restrictions.remove(&target)
    }

    /// Drops restrictions that lapsed before `now`. Returns how many.
    ///
    /// Enforcement does not need this; it keeps memory proportional to
    /// live restrictions on long-running rooms.
    pub fn purge_expired(&mut self, now: I) -> usize {
        let before = self.restrictions.len();
        self.restrictions.retain(|_, restriction| restriction.is_active(now));
        before - self.restrictions.len()
    }

    /// Appends an audit entry, evicting the oldest past the cap.
    pub fn record(&mut self, entry: AuditEntry) {
        if self.audit.len() == MAX_AUDIT_ENTRIES {
            self.audit.pop_front();
        }
        self.audit.push_back(entry);
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.iter().rev().take(limit).cloned().collect()
    }
}

impl<I> Default for ModerationState<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new()
    }
}
