//! Room definitions and membership rosters.
//!
//! A room is described by an immutable [`RoomDefinition`] (persisted by the
//! server) and a live [`Roster`] of joined members (tied to connections,
//! never persisted). Direct conversations are synthesized rooms: the pair
//! of participants fixes the id via [`direct_room_id`], the roster is the
//! pair itself, and no membership events are broadcast for them.

use std::collections::BTreeSet;
use std::collections::btree_map::{BTreeMap, Entry};

pub use parlor_proto::payloads::room::{Role, RoomKind};
use serde::{Deserialize, Serialize};

use crate::error::RoomError;

/// Room identifier.
///
/// Explicit rooms are minted with the top bit set; direct rooms pack the
/// participant pair into the low bits (see [`direct_room_id`]). The two id
/// spaces never collide as long as user ids stay below `2^63`.
pub type RoomId = u128;

/// User identifier, assigned by the platform's account service.
pub type UserId = u64;

/// Largest member capacity a room may be created with.
pub const MAX_ROOM_CAPACITY: u32 = 10_000;

/// Canonical room id for the direct conversation between two users.
///
/// The pair is ordered before packing, so both participants derive the same
/// id regardless of who opens the conversation. A user's notes-to-self
/// conversation (`a == b`) is a valid direct room.
pub fn direct_room_id(a: UserId, b: UserId) -> RoomId {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    (u128::from(low) << 64) | u128::from(high)
}

/// Splits a direct room id back into its ordered participant pair.
pub fn direct_peers(room_id: RoomId) -> (UserId, UserId) {
    ((room_id >> 64) as UserId, room_id as UserId)
}

/// Whether a room id belongs to the direct-conversation id space.
pub fn is_direct_room_id(room_id: RoomId) -> bool {
    room_id >> 127 == 0
}

/// Immutable description of a room.
///
/// This is the persisted shape: the server stores definitions at creation
/// and reloads them at startup. Live state (roster, sequence counter,
/// reactions, ...) is rebuilt, not stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDefinition {
    /// Room identifier.
    pub id: RoomId,
    /// What kind of space this is.
    pub kind: RoomKind,
    /// Maximum number of concurrent members.
    pub capacity: u32,
    /// Whether joining requires an invitation.
    pub private: bool,
    /// User that created the room. Receives the Admin role on every join.
    pub creator: UserId,
    /// Users invited to a private room. Ignored for public rooms.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allow_list: BTreeSet<UserId>,
}

impl RoomDefinition {
    /// Definition for the direct conversation between `a` and `b`.
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self {
            id: direct_room_id(a, b),
            kind: RoomKind::Direct,
            capacity: 2,
            private: true,
            creator: a.min(b),
            allow_list: BTreeSet::from([a, b]),
        }
    }

    /// Whether this is a synthesized direct conversation.
    ///
    /// Direct rooms have a fixed two-member roster and skip membership
    /// broadcasts, role changes, and invitations.
    pub fn is_direct(&self) -> bool {
        self.kind == RoomKind::Direct
    }

    /// Whether `user_id` may join under the privacy rules.
    ///
    /// Public rooms admit anyone; private rooms admit the creator and
    /// invited users only. Capacity and moderation checks are separate.
    pub fn allows(&self, user_id: UserId) -> bool {
        !self.private || user_id == self.creator || self.allow_list.contains(&user_id)
    }

    /// Validates a requested capacity at room creation.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` when the capacity is zero or above
    /// [`MAX_ROOM_CAPACITY`].
    pub fn validate_capacity(capacity: u32) -> Result<u32, RoomError> {
        if capacity == 0 {
            return Err(RoomError::Malformed("room capacity must be at least 1".to_string()));
        }
        if capacity > MAX_ROOM_CAPACITY {
            return Err(RoomError::Malformed(format!(
                "room capacity {capacity} exceeds maximum {MAX_ROOM_CAPACITY}"
            )));
        }
        Ok(capacity)
    }
}

/// A user's membership in one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member's user id.
    pub user_id: UserId,
    /// Display name resolved from the user directory at join time. Mention
    /// resolution runs against these, so a member without a known name is
    /// not mentionable.
    pub username: Option<String>,
    /// Role within this room. The single authority for authorization.
    pub role: Role,
    /// Wall clock when the user joined, Unix milliseconds.
    pub joined_at_ms: u64,
}

/// Live membership of one room.
///
/// Keyed by user id: a user connected from several devices still holds one
/// membership. Ordered iteration keeps broadcast order stable.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: BTreeMap<UserId, Member>,
}

impl Roster {
    /// Creates an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of current members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `user_id` is currently a member.
    pub fn contains(&self, user_id: UserId) -> bool {
        self.members.contains_key(&user_id)
    }

    /// Membership record for `user_id`, if present.
    pub fn get(&self, user_id: UserId) -> Option<&Member> {
        self.members.get(&user_id)
    }

    /// Role held by `user_id`, if a member.
    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        self.members.get(&user_id).map(|member| member.role)
    }

    /// Adds a member. Returns `false` if the user was already present, in
    /// which case the existing record is kept untouched.
    pub fn insert(&mut self, member: Member) -> bool {
        match self.members.entry(member.user_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(member);
                true
            }
        }
    }

    /// Removes a member, returning the record if one existed.
    pub fn remove(&mut self, user_id: UserId) -> Option<Member> {
        self.members.remove(&user_id)
    }

    /// Replaces a member's role, returning the previous one.
    ///
    /// Returns `None` (and changes nothing) if the user is not a member.
    pub fn set_role(&mut self, user_id: UserId, role: Role) -> Option<Role> {
        let member = self.members.get_mut(&user_id)?;
        let previous = member.role;
        member.role = role;
        Some(previous)
    }

    /// Iterates members in user id order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Iterates member user ids in order.
    pub fn user_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.members.keys().copied()
    }

    /// Display names of members that have one, keyed by user id.
    ///
    /// This is the lookup table handed to mention resolution.
    pub fn usernames(&self) -> std::collections::HashMap<UserId, String> {
        self.members
            .values()
            .filter_map(|member| Some((member.user_id, member.username.clone()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_room_id_is_order_independent() {
        assert_eq!(direct_room_id(3, 9), direct_room_id(9, 3));
        assert_ne!(direct_room_id(3, 9), direct_room_id(3, 10));
    }

    #[test]
    fn direct_peers_round_trip() {
        let id = direct_room_id(900, 4);
        assert_eq!(direct_peers(id), (4, 900));
    }

    #[test]
    fn notes_to_self_is_a_valid_direct_room() {
        let id = direct_room_id(7, 7);
        assert_eq!(direct_peers(id), (7, 7));
        assert!(is_direct_room_id(id));
    }

    #[test]
    fn direct_ids_stay_out_of_the_minted_space() {
        let minted = (1_u128 << 127) | 0xdead_beef;
        assert!(!is_direct_room_id(minted));
        assert!(is_direct_room_id(direct_room_id(u64::MAX >> 1, 2)));
    }

    #[test]
    fn public_room_allows_anyone() {
        let def = RoomDefinition {
            id: 1,
            kind: RoomKind::Topic,
            capacity: 50,
            private: false,
            creator: 1,
            allow_list: BTreeSet::new(),
        };
        assert!(def.allows(999));
    }

    #[test]
    fn private_room_allows_creator_and_invitees_only() {
        let def = RoomDefinition {
            id: 1,
            kind: RoomKind::Community,
            capacity: 50,
            private: true,
            creator: 1,
            allow_list: BTreeSet::from([5]),
        };
        assert!(def.allows(1));
        assert!(def.allows(5));
        assert!(!def.allows(6));
    }

    #[test]
    fn direct_definition_covers_both_participants() {
        let def = RoomDefinition::direct(20, 10);
        assert!(def.is_direct());
        assert_eq!(def.capacity, 2);
        assert!(def.private);
        assert!(def.allows(10));
        assert!(def.allows(20));
        assert!(!def.allows(30));
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        assert!(RoomDefinition::validate_capacity(0).is_err());
        assert_eq!(RoomDefinition::validate_capacity(1).unwrap(), 1);
        assert_eq!(RoomDefinition::validate_capacity(MAX_ROOM_CAPACITY).unwrap(), MAX_ROOM_CAPACITY);
        assert!(RoomDefinition::validate_capacity(MAX_ROOM_CAPACITY + 1).is_err());
    }

    fn member(user_id: UserId, role: Role) -> Member {
        Member { user_id, username: None, role, joined_at_ms: 0 }
    }

    #[test]
    fn roster_insert_is_first_wins() {
        let mut roster = Roster::new();
        assert!(roster.insert(member(1, Role::Admin)));
        assert!(!roster.insert(member(1, Role::Member)));

        assert_eq!(roster.role_of(1), Some(Role::Admin));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn roster_set_role_requires_membership() {
        let mut roster = Roster::new();
        assert!(roster.set_role(1, Role::Moderator).is_none());

        roster.insert(member(1, Role::Member));
        assert_eq!(roster.set_role(1, Role::Moderator), Some(Role::Member));
        assert_eq!(roster.role_of(1), Some(Role::Moderator));
    }

    #[test]
    fn roster_iterates_in_user_id_order() {
        let mut roster = Roster::new();
        for user_id in [30, 10, 20] {
            roster.insert(member(user_id, Role::Member));
        }

        let ids: Vec<_> = roster.user_ids().collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn usernames_skip_members_without_one() {
        let mut roster = Roster::new();
        roster.insert(Member {
            user_id: 1,
            username: Some("alice".to_string()),
            role: Role::Member,
            joined_at_ms: 0,
        });
        roster.insert(member(2, Role::Member));

        let names = roster.usernames();
        assert_eq!(names.len(), 1);
        assert_eq!(names.get(&1).map(String::as_str), Some("alice"));
    }
}
