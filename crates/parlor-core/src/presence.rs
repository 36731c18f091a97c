//! User presence derived from connection counts.
//!
//! A user is online while at least one of their devices holds an
//! authenticated connection. Connections are refcounted per user, so a
//! second device neither announces anything nor does closing it mark the
//! user offline. Away and Busy are user-level overrides that survive until
//! changed or until the last connection drops.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parlor_proto::payloads::presence::{PresenceEvent, PresenceStatus};

use crate::room::UserId;

#[derive(Debug, Clone, Copy)]
struct UserPresence {
    connections: u32,
    /// Manual Away or Busy override. Never holds Online or Offline.
    manual: Option<PresenceStatus>,
    last_active_ms: u64,
}

impl UserPresence {
    fn effective(&self) -> PresenceStatus {
        if self.connections == 0 {
            PresenceStatus::Offline
        } else {
            self.manual.unwrap_or(PresenceStatus::Online)
        }
    }
}

/// Tracks effective presence for every connected user.
///
/// Mutating calls return the [`PresenceEvent`] to broadcast when the
/// user's effective status changed, or `None` when nothing visible
/// happened. Users with no connections are not retained.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: HashMap<UserId, UserPresence>,
}

impl PresenceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new authenticated connection for `user_id`.
    ///
    /// Emits an Online event on the first connection only.
    pub fn connect(&mut self, user_id: UserId, now_ms: u64) -> Option<PresenceEvent> {
        let entry = self.users.entry(user_id).or_insert(UserPresence {
            connections: 0,
            manual: None,
            last_active_ms: now_ms,
        });
        let before = entry.effective();
        entry.connections = entry.connections.saturating_add(1);
        entry.last_active_ms = now_ms;
        let after = entry.effective();

        (before != after).then_some(PresenceEvent {
            user_id,
            status: after,
            last_active_ms: now_ms,
        })
    }

    /// Records a closed connection for `user_id`.
    ///
    /// Emits an Offline event when the last connection drops; the manual
    /// override is discarded with it. Unknown users are ignored.
    pub fn disconnect(&mut self, user_id: UserId, now_ms: u64) -> Option<PresenceEvent> {
        let Entry::Occupied(mut slot) = self.users.entry(user_id) else {
            return None;
        };
        let entry = slot.get_mut();
        entry.connections = entry.connections.saturating_sub(1);
        entry.last_active_ms = now_ms;

        if entry.connections == 0 {
            slot.remove();
            return Some(PresenceEvent {
                user_id,
                status: PresenceStatus::Offline,
                last_active_ms: now_ms,
            });
        }
        None
    }

    /// Applies a manual status request from the user.
    ///
    /// Away and Busy set the override; Online clears it. Offline requests
    /// are ignored, there is no invisible mode. Emits an event only when
    /// the effective status changed.
    pub fn set_status(
        &mut self,
        user_id: UserId,
        requested: PresenceStatus,
        now_ms: u64,
    ) -> Option<PresenceEvent> {
        if requested == PresenceStatus::Offline {
            return None;
        }
        let entry = self.users.get_mut(&user_id)?;

        let before = entry.effective();
        entry.manual = match requested {
            PresenceStatus::Online | PresenceStatus::Offline => None,
            PresenceStatus::Away | PresenceStatus::Busy => Some(requested),
        };
        entry.last_active_ms = now_ms;
        let after = entry.effective();

        (before != after).then_some(PresenceEvent {
            user_id,
            status: after,
            last_active_ms: now_ms,
        })
    }

    /// Current effective status for `user_id`.
    pub fn status_of(&self, user_id: UserId) -> PresenceStatus {
        self.users.get(&user_id).map_or(PresenceStatus::Offline, UserPresence::effective)
    }

    /// Presence event describing the current state of `user_id`.
    ///
    /// Used to seed a just-joined member with the presence of the room.
    /// Returns `None` for users with no connections.
    pub fn snapshot_of(&self, user_id: UserId) -> Option<PresenceEvent> {
        let entry = self.users.get(&user_id)?;
        Some(PresenceEvent {
            user_id,
            status: entry.effective(),
            last_active_ms: entry.last_active_ms,
        })
    }

    /// Number of users with at least one connection.
    pub fn online_users(&self) -> usize {
        self.users.len()
    }
}
