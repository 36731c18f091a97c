//! Per-room emoji reaction aggregation.
//!
//! Reactions are live room state, not history: the board aggregates
//! (message, emoji) tuples for fan-out and is rebuilt empty when a room
//! worker restarts. Toggling is idempotent by construction, the same user
//! toggling the same tuple twice lands back where they started.

use std::collections::BTreeMap;

use parlor_proto::payloads::reactions::ReactionEvent;

use crate::room::UserId;

/// Aggregated reactions for one room.
///
/// Reactor lists keep first-react order so clients can render "liked by
/// Alice, Bob and 3 others" without sorting on their side.
#[derive(Debug, Default)]
pub struct ReactionBoard {
    by_message: BTreeMap<u64, BTreeMap<String, Vec<UserId>>>,
}

impl ReactionBoard {
    /// Creates an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles `user_id`'s reaction on a message.
    ///
    /// Activates the (message, user, emoji) tuple if absent, deactivates
    /// it if present. The returned event carries the direction and the
    /// post-toggle aggregate count for that emoji.
    pub fn toggle(&mut self, message_id: u64, user_id: UserId, emoji: &str) -> ReactionEvent {
        let emojis = self.by_message.entry(message_id).or_default();
        let reactors = emojis.entry(emoji.to_string()).or_default();

        let added = match reactors.iter().position(|id| *id == user_id) {
            Some(index) => {
                reactors.remove(index);
                false
            }
            None => {
                reactors.push(user_id);
                true
            }
        };
        let count = reactors.len() as u32;

        // Drop empty levels so the board stays proportional to live state.
        if reactors.is_empty() {
            emojis.remove(emoji);
            if emojis.is_empty() {
                self.by_message.remove(&message_id);
            }
        }

        ReactionEvent { message_id, user_id, emoji: emoji.to_string(), added, count }
    }

    /// Number of active reactions with `emoji` on a message.
    pub fn count(&self, message_id: u64, emoji: &str) -> u32 {
        self.by_message
            .get(&message_id)
            .and_then(|emojis| emojis.get(emoji))
            .map_or(0, |reactors| reactors.len() as u32)
    }

    /// Users currently reacting with `emoji`, in first-react order.
    pub fn reactors(&self, message_id: u64, emoji: &str) -> &[UserId] {
        self.by_message
            .get(&message_id)
            .and_then(|emojis| emojis.get(emoji))
            .map_or(&[], Vec::as_slice)
    }

    /// Whether the tuple is currently active.
    pub fn has_reacted(&self, message_id: u64, user_id: UserId, emoji: &str) -> bool {
        self.reactors(message_id, emoji).contains(&user_id)
    }

    /// Drops all reactions on a message, as when it is deleted.
    pub fn remove_message(&mut self, message_id: u64) {
        self.by_message.remove(&message_id);
    }

    /// Whether the board holds no active reactions.
    pub fn is_empty(&self) -> bool {
        self.by_message.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_adds_then_removes() {
        let mut board = ReactionBoard::new();

        let event = board.toggle(100, 1, "\u{1f44d}");
        assert!(event.added);
        assert_eq!(event.count, 1);

        let event = board.toggle(100, 1, "\u{1f44d}");
        assert!(!event.added);
        assert_eq!(event.count, 0);
        assert!(board.is_empty());
    }

    #[test]
    fn counts_aggregate_across_users() {
        let mut board = ReactionBoard::new();
        board.toggle(100, 1, "🔥");
        board.toggle(100, 2, "🔥");
        let event = board.toggle(100, 3, "🔥");

        assert_eq!(event.count, 3);
        assert_eq!(board.count(100, "🔥"), 3);
    }

    #[test]
    fn emojis_are_tracked_independently() {
        let mut board = ReactionBoard::new();
        board.toggle(100, 1, "🔥");
        board.toggle(100, 1, "👀");

        assert_eq!(board.count(100, "🔥"), 1);
        assert_eq!(board.count(100, "👀"), 1);

        board.toggle(100, 1, "🔥");
        assert_eq!(board.count(100, "🔥"), 0);
        assert_eq!(board.count(100, "👀"), 1);
    }

    #[test]
    fn one_user_cannot_stack_the_same_emoji() {
        let mut board = ReactionBoard::new();
        board.toggle(100, 1, "🔥");
        board.toggle(100, 1, "🔥");
        let event = board.toggle(100, 1, "🔥");

        assert!(event.added);
        assert_eq!(event.count, 1);
    }

    #[test]
    fn reactors_keep_first_react_order() {
        let mut board = ReactionBoard::new();
        board.toggle(100, 30, "🔥");
        board.toggle(100, 10, "🔥");
        board.toggle(100, 20, "🔥");

        assert_eq!(board.reactors(100, "🔥"), &[30, 10, 20]);
        assert!(board.has_reacted(100, 10, "🔥"));
        assert!(!board.has_reacted(100, 40, "🔥"));
    }

    #[test]
    fn removing_a_message_drops_its_reactions() {
        let mut board = ReactionBoard::new();
        board.toggle(100, 1, "🔥");
        board.toggle(200, 1, "🔥");

        board.remove_message(100);

        assert_eq!(board.count(100, "🔥"), 0);
        assert_eq!(board.count(200, "🔥"), 1);
    }
}
