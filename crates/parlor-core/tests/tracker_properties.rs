//! Property-based tests for the room state trackers.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parlor_core::mentions::resolve_mentions;
use parlor_core::moderation::{ModerationState, RestrictionKind};
use parlor_core::presence::PresenceTracker;
use parlor_core::reactions::ReactionBoard;
use parlor_core::receipts::ReceiptLog;
use parlor_core::sequencer::Sequencer;
use parlor_core::typing::{TYPING_IDLE_TIMEOUT, TypingTracker};
use parlor_proto::payloads::presence::PresenceStatus;
use proptest::prelude::*;

const EMOJIS: [&str; 3] = ["🔥", "👍", "👀"];

/// Property: toggling any tuple twice restores the board to its prior state.
#[test]
fn prop_reaction_double_toggle_is_identity() {
    proptest!(|(
        ops in prop::collection::vec((0..5u64, 0..5u64, 0..3usize), 0..40),
        probe in (0..5u64, 0..5u64, 0..3usize),
    )| {
        let mut board = ReactionBoard::new();
        for (message, user, emoji) in &ops {
            board.toggle(*message, *user, EMOJIS[*emoji]);
        }

        let (message, user, emoji) = probe;
        let emoji = EMOJIS[emoji];
        let count_before = board.count(message, emoji);
        let active_before = board.has_reacted(message, user, emoji);

        let first = board.toggle(message, user, emoji);
        let second = board.toggle(message, user, emoji);

        prop_assert_ne!(first.added, second.added);
        prop_assert_eq!(board.count(message, emoji), count_before);
        prop_assert_eq!(board.has_reacted(message, user, emoji), active_before);
    });
}

/// Property: the aggregate count always equals the reactor list length.
#[test]
fn prop_reaction_count_matches_reactors() {
    proptest!(|(ops in prop::collection::vec((0..5u64, 0..5u64, 0..3usize), 0..60))| {
        let mut board = ReactionBoard::new();
        let mut touched = HashSet::new();
        for (message, user, emoji) in &ops {
            board.toggle(*message, *user, EMOJIS[*emoji]);
            touched.insert((*message, *emoji));
        }

        for (message, emoji) in touched {
            let emoji = EMOJIS[emoji];
            prop_assert_eq!(board.count(message, emoji) as usize, board.reactors(message, emoji).len());
        }
    });
}

/// Property: a user is online exactly while their connection balance is
/// positive, and online/offline announcements fire once per transition.
#[test]
fn prop_presence_tracks_connection_balance() {
    proptest!(|(ops in prop::collection::vec(any::<bool>(), 0..40))| {
        let mut tracker = PresenceTracker::new();
        let mut balance = 0u32;
        let mut expected_online_events = 0u32;
        let mut expected_offline_events = 0u32;
        let mut online_events = 0u32;
        let mut offline_events = 0u32;

        for (step, connect) in ops.iter().enumerate() {
            let now_ms = step as u64;
            if *connect {
                if balance == 0 {
                    expected_online_events += 1;
                }
                balance += 1;
                if tracker.connect(7, now_ms).is_some() {
                    online_events += 1;
                }
            } else {
                if balance == 1 {
                    expected_offline_events += 1;
                }
                balance = balance.saturating_sub(1);
                if tracker.disconnect(7, now_ms).is_some() {
                    offline_events += 1;
                }
            }

            let expected = if balance > 0 { PresenceStatus::Online } else { PresenceStatus::Offline };
            prop_assert_eq!(tracker.status_of(7), expected);
        }

        prop_assert_eq!(online_events, expected_online_events);
        prop_assert_eq!(offline_events, expected_offline_events);
    });
}

/// Property: a sweep expires exactly the indicators older than the timeout.
#[test]
fn prop_typing_sweep_expires_exactly_stale() {
    proptest!(|(
        users in prop::collection::hash_set(1..100u64, 0..10),
        dt_ms in 0..3000u64,
    )| {
        let t0 = Instant::now();
        let mut typing = TypingTracker::new(TYPING_IDLE_TIMEOUT);
        for user in &users {
            typing.set(*user, true, t0);
        }

        let events = typing.sweep(t0 + Duration::from_millis(dt_ms));

        if dt_ms >= TYPING_IDLE_TIMEOUT.as_millis() as u64 {
            let mut expected: Vec<_> = users.iter().copied().collect();
            expected.sort_unstable();
            let swept: Vec<_> = events.iter().map(|event| event.user_id).collect();
            prop_assert_eq!(swept, expected);
            prop_assert!(typing.is_empty());
        } else {
            prop_assert!(events.is_empty());
            for user in &users {
                prop_assert!(typing.is_typing(*user));
            }
        }
    });
}

/// Property: a timed restriction blocks sends strictly before its expiry
/// and never at or after it.
#[test]
fn prop_restriction_blocks_exactly_while_active() {
    proptest!(|(duration_s in 1..10_000u64, elapsed_s in 0..20_000u64)| {
        let t0 = Instant::now();
        let mut state = ModerationState::new();
        state.impose(5, RestrictionKind::Mute, 1, "test", Some(Duration::from_secs(duration_s)), t0);

        let now = t0 + Duration::from_secs(elapsed_s);
        let blocked = state.check_send(5, now).is_err();

        prop_assert_eq!(blocked, elapsed_s < duration_s);
    });
}

/// Property: only the first mark per (message, reader) is announced, and
/// reader lists never hold duplicates.
#[test]
fn prop_receipts_announce_first_mark_only() {
    proptest!(|(ops in prop::collection::vec((0..3u64, 0..4u64), 0..40))| {
        let mut log = ReceiptLog::new();
        let mut seen = HashSet::new();

        for (step, (message, user)) in ops.iter().enumerate() {
            let announced = log.mark(*message, *user, step as u64).is_some();
            prop_assert_eq!(announced, seen.insert((*message, *user)));
        }

        for message in 0..3u64 {
            let readers: Vec<_> = log.readers(message).iter().map(|entry| entry.user_id).collect();
            let unique: HashSet<_> = readers.iter().copied().collect();
            prop_assert_eq!(unique.len(), readers.len());
        }
    });
}

/// Property: mention resolution yields member ids only, without the
/// sender, without duplicates, in first-mention order.
#[test]
fn prop_mentions_resolve_members_in_order() {
    let token_pool = ["@alice", "@bob", "bob", "x@alice", "hello", "@carol", "@ALICE"];
    proptest!(|(
        picks in prop::collection::vec(0..token_pool.len(), 0..12),
        sender in 0..4u64,
    )| {
        let names: HashMap<u64, String> =
            HashMap::from([(1, "alice".to_string()), (2, "bob".to_string())]);
        let tokens: Vec<&str> = picks.iter().map(|i| token_pool[*i]).collect();
        let content = tokens.join(" ");

        let mut expected = Vec::new();
        for token in &tokens {
            let id = match *token {
                "@alice" | "@ALICE" => Some(1),
                "@bob" => Some(2),
                _ => None,
            };
            if let Some(id) = id {
                if id != sender && !expected.contains(&id) {
                    expected.push(id);
                }
            }
        }

        prop_assert_eq!(resolve_mentions(&content, &names, sender), expected);
    });
}

/// Property: a fresh room hands out exactly the dense sequence 1..=n.
#[test]
fn prop_sequences_are_dense_from_one() {
    proptest!(|(n in 1..200u64)| {
        let mut sequencer = Sequencer::fresh();
        let assigned: Vec<u64> = (0..n).map(|_| sequencer.assign(1).unwrap()).collect();
        let expected: Vec<u64> = (1..=n).collect();
        prop_assert_eq!(assigned, expected);
    });
}
