//! Session registry and membership index.
//!
//! [`SessionRegistry`] tracks live authenticated sessions and their outbound
//! frame queues. A user may hold several sessions at once (one per device);
//! presence aggregation and implicit leave both key off "was that the user's
//! last session", which the registry answers at unregister time.
//!
//! [`MembershipIndex`] is the user-level view of room membership, maintained
//! by room workers and read by the gateway to decide who receives a user's
//! presence transitions (everyone sharing at least one room).

use std::collections::{HashMap, HashSet};

use parlor_proto::Frame;
use tokio::sync::mpsc;

/// A live authenticated session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// User the session authenticated as.
    pub user_id: u64,
    /// Display name resolved at authentication, if the directory knows one.
    pub username: Option<String>,
    /// Queue draining into the session's outbound uni stream.
    pub outbound: mpsc::Sender<Frame>,
}

/// Registry of live sessions, keyed by session id.
///
/// Plain data structure; the runtime wraps it in an async `RwLock`. Reads
/// (fan-out) vastly outnumber writes (connect/disconnect).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<u64, SessionHandle>,
    user_sessions: HashMap<u64, HashSet<u64>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. Returns `false` if the session id is already
    /// registered, in which case nothing changes.
    pub fn register(&mut self, session_id: u64, handle: SessionHandle) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }

        self.user_sessions.entry(handle.user_id).or_default().insert(session_id);
        self.sessions.insert(session_id, handle);
        true
    }

    /// Removes a session.
    ///
    /// Returns the handle and whether this was the user's last live session
    /// (the signal that drives offline presence and implicit leave).
    pub fn unregister(&mut self, session_id: u64) -> Option<(SessionHandle, bool)> {
        let handle = self.sessions.remove(&session_id)?;

        let mut was_last = false;
        if let Some(sessions) = self.user_sessions.get_mut(&handle.user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                self.user_sessions.remove(&handle.user_id);
                was_last = true;
            }
        }

        Some((handle, was_last))
    }

    /// Handle for one session.
    pub fn get(&self, session_id: u64) -> Option<&SessionHandle> {
        self.sessions.get(&session_id)
    }

    /// Outbound queue for one session.
    pub fn outbound(&self, session_id: u64) -> Option<mpsc::Sender<Frame>> {
        self.sessions.get(&session_id).map(|handle| handle.outbound.clone())
    }

    /// Outbound queues for every session of a user.
    pub fn outbounds_for_user(&self, user_id: u64) -> Vec<mpsc::Sender<Frame>> {
        self.user_sessions
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|session_id| self.outbound(*session_id))
            .collect()
    }

    /// Session ids belonging to a user.
    pub fn sessions_of(&self, user_id: u64) -> Vec<u64> {
        self.user_sessions
            .get(&user_id)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the user has at least one live session.
    pub fn is_online(&self, user_id: u64) -> bool {
        self.user_sessions.contains_key(&user_id)
    }

    /// Number of live sessions across all users.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// User-level membership, mirrored out of the room workers.
///
/// Workers are the authority (their rosters gate every room command); this
/// index only answers the cross-room question "which rooms is this user in"
/// without a fan-in query to every worker.
#[derive(Debug, Default)]
pub struct MembershipIndex {
    rooms_by_user: HashMap<u64, HashSet<u128>>,
    users_by_room: HashMap<u128, HashSet<u64>>,
}

impl MembershipIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a user joined a room.
    pub fn record_join(&mut self, user_id: u64, room_id: u128) {
        self.rooms_by_user.entry(user_id).or_default().insert(room_id);
        self.users_by_room.entry(room_id).or_default().insert(user_id);
    }

    /// Records that a user left a room.
    pub fn record_leave(&mut self, user_id: u64, room_id: u128) {
        if let Some(rooms) = self.rooms_by_user.get_mut(&user_id) {
            rooms.remove(&room_id);
            if rooms.is_empty() {
                self.rooms_by_user.remove(&user_id);
            }
        }
        if let Some(users) = self.users_by_room.get_mut(&room_id) {
            users.remove(&user_id);
            if users.is_empty() {
                self.users_by_room.remove(&room_id);
            }
        }
    }

    /// Rooms the user is currently a member of.
    pub fn rooms_of(&self, user_id: u64) -> Vec<u128> {
        self.rooms_by_user
            .get(&user_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Members of one room.
    pub fn users_in(&self, room_id: u128) -> Vec<u64> {
        self.users_by_room
            .get(&room_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Users sharing at least one room with `user_id`, excluding the user.
    ///
    /// This is the presence fan-out audience: nobody else can see the user
    /// anyway. Sorted and deduplicated.
    pub fn peers_of(&self, user_id: u64) -> Vec<u64> {
        let mut peers: Vec<u64> = self
            .rooms_by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|room_id| self.users_by_room.get(room_id))
            .flatten()
            .copied()
            .filter(|&peer| peer != user_id)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}
