//! Property-based tests for the storage backends.
//!
//! The memory and redb implementations must be observationally identical:
//! any history of appends and tombstones has to produce the same reads from
//! both. Append preconditions and definition persistence are checked
//! against randomized inputs rather than hand-picked cases.

use std::collections::BTreeSet;

use parlor_core::room::{RoomDefinition, RoomKind};
use parlor_proto::payloads::room::{MessageKind, MessageRecord};
use parlor_server::{MemoryStorage, RedbStorage, Storage, StorageError};
use proptest::prelude::*;

const ROOM: u128 = 0x8000_0000_0000_0000_0000_0000_0000_0C0D;

/// Builds a record for one log slot. Ids are derived from the sequence but
/// distinct from it, so lookups by id cannot accidentally pass by reading
/// the sequence column.
fn record(sequence: u64, content: &str) -> MessageRecord {
    MessageRecord {
        id: sequence * 1000 + 7,
        sender_id: 1 + sequence % 3,
        sequence,
        kind: MessageKind::Text,
        content: content.to_string(),
        reply_to: None,
        mentions: Vec::new(),
        created_at_ms: 1_700_000_000_000 + sequence,
    }
}

fn message_id_for(sequence: u64) -> u64 {
    sequence * 1000 + 7
}

fn room_kind() -> impl Strategy<Value = RoomKind> {
    prop_oneof![
        Just(RoomKind::Topic),
        Just(RoomKind::Region),
        Just(RoomKind::Community),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: after the same appends and tombstones, both backends
    /// agree on every read, and paging from the top visits exactly the
    /// non-tombstoned sequences, newest first.
    #[test]
    fn prop_backends_agree_on_reads(
        count in 1usize..24,
        tombstoned in prop::collection::vec(any::<bool>(), 24),
        page_size in 1usize..10,
    ) {
        let dir = tempfile::tempdir()?;
        let memory = MemoryStorage::new();
        let durable = RedbStorage::open(dir.path().join("parlor.redb"))?;

        for sequence in 1..=count as u64 {
            let entry = record(sequence, &format!("note {sequence}"));
            memory.append_message(ROOM, &entry)?;
            durable.append_message(ROOM, &entry)?;
        }
        for sequence in 1..=count as u64 {
            if tombstoned[sequence as usize - 1] {
                prop_assert!(memory.tombstone_message(ROOM, message_id_for(sequence))?);
                prop_assert!(durable.tombstone_message(ROOM, message_id_for(sequence))?);
            }
        }

        // Tombstones keep their slots: the latest sequence never shrinks.
        prop_assert_eq!(memory.latest_sequence(ROOM)?, Some(count as u64));
        prop_assert_eq!(durable.latest_sequence(ROOM)?, Some(count as u64));

        // Id lookups return the record with its flag on both backends.
        for sequence in 1..=count as u64 {
            let from_memory = memory.load_message(ROOM, message_id_for(sequence))?;
            let from_durable = durable.load_message(ROOM, message_id_for(sequence))?;
            prop_assert_eq!(&from_memory, &from_durable);
            let stored = from_memory.expect("every appended message is loadable");
            prop_assert_eq!(stored.deleted, tombstoned[sequence as usize - 1]);
        }

        // Page downward with the same cursor on both until exhausted.
        let mut walked = Vec::new();
        let mut cursor = None;
        loop {
            let page_memory = memory.load_history(ROOM, cursor, page_size)?;
            let page_durable = durable.load_history(ROOM, cursor, page_size)?;
            prop_assert_eq!(&page_memory, &page_durable);
            if page_memory.is_empty() {
                break;
            }
            prop_assert!(page_memory.len() <= page_size);
            cursor = Some(page_memory[page_memory.len() - 1].sequence);
            walked.extend(page_memory.into_iter().map(|entry| entry.sequence));
        }

        let expected: Vec<u64> = (1..=count as u64)
            .rev()
            .filter(|sequence| !tombstoned[*sequence as usize - 1])
            .collect();
        prop_assert_eq!(walked, expected);
    }

    /// Property: appends that skip ahead of or fall behind the log are
    /// rejected with the slot the log would accept, and the log still
    /// takes the correct slot afterwards.
    #[test]
    fn prop_append_rejects_out_of_order_sequences(
        filled in 0usize..12,
        gap in 2u64..50,
    ) {
        let storage = MemoryStorage::new();
        for sequence in 1..=filled as u64 {
            storage.append_message(ROOM, &record(sequence, "ok"))?;
        }

        let next = filled as u64 + 1;
        let ahead = next + gap;
        let err = storage.append_message(ROOM, &record(ahead, "gap")).unwrap_err();
        prop_assert_eq!(err, StorageError::Conflict { expected: next, got: ahead });

        if filled > 0 {
            let taken = filled as u64;
            let err = storage.append_message(ROOM, &record(taken, "dup")).unwrap_err();
            prop_assert_eq!(err, StorageError::Conflict { expected: next, got: taken });
        }

        storage.append_message(ROOM, &record(next, "ok"))?;
        prop_assert_eq!(storage.latest_sequence(ROOM)?, Some(next));
    }

    /// Property: a redb database reopened from disk serves the same room
    /// definition and history it was closed with.
    #[test]
    fn prop_redb_state_survives_reopen(
        kind in room_kind(),
        capacity in 1u32..=10_000,
        private in any::<bool>(),
        allow_list in prop::collection::btree_set(1u64..500, 0..6),
        count in 1usize..10,
    ) {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("parlor.redb");
        let definition = RoomDefinition {
            id: ROOM,
            kind,
            capacity,
            private,
            creator: 42,
            allow_list,
        };

        {
            let storage = RedbStorage::open(&path)?;
            storage.create_room(&definition)?;
            for sequence in 1..=count as u64 {
                storage.append_message(ROOM, &record(sequence, &format!("note {sequence}")))?;
            }
        }

        let reopened = RedbStorage::open(&path)?;
        prop_assert_eq!(reopened.load_room(ROOM)?, Some(definition));
        prop_assert_eq!(reopened.list_rooms()?, vec![ROOM]);
        prop_assert_eq!(reopened.latest_sequence(ROOM)?, Some(count as u64));
        prop_assert_eq!(reopened.load_history(ROOM, None, count)?.len(), count);
    }

    /// Property: create_room keeps the first definition it saw;
    /// update_room replaces it.
    #[test]
    fn prop_create_keeps_first_definition_update_overwrites(
        kind in room_kind(),
        first_capacity in 1u32..=10_000,
        second_capacity in 1u32..=10_000,
        invited in prop::collection::btree_set(1u64..500, 0..8),
    ) {
        let storage = MemoryStorage::new();
        let original = RoomDefinition {
            id: ROOM,
            kind,
            capacity: first_capacity,
            private: true,
            creator: 42,
            allow_list: BTreeSet::new(),
        };
        storage.create_room(&original)?;

        let mut altered = original.clone();
        altered.capacity = second_capacity;
        altered.allow_list = invited;
        storage.create_room(&altered)?;
        prop_assert_eq!(storage.load_room(ROOM)?, Some(original));

        storage.update_room(&altered)?;
        prop_assert_eq!(storage.load_room(ROOM)?, Some(altered));
    }
}
