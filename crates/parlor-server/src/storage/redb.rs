//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Room
//! definitions and message logs survive server restarts; live state (rosters,
//! typing, presence) is rebuilt by the runtime and never stored here.

use std::{path::Path, sync::Arc};

use parlor_core::room::RoomDefinition;
use parlor_proto::payloads::room::MessageRecord;
use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError, StoredMessage};

/// Table: messages
/// Key: (room_id: u128, sequence: u64) as big-endian bytes [24 bytes]
/// Value: CBOR-encoded StoredMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: message_index
/// Key: (room_id: u128, message_id: u64) as big-endian bytes [24 bytes]
/// Value: sequence as big-endian bytes [8 bytes]
///
/// Secondary index so deletes and reaction validation can find a message by
/// id without scanning the log.
const MESSAGE_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("message_index");

/// Table: rooms
/// Key: room_id as big-endian bytes [16 bytes]
/// Value: CBOR-encoded RoomDefinition
const ROOMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rooms");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (MESSAGES, MESSAGE_INDEX, ROOMS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(MESSAGE_INDEX).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Latest stored sequence for a room, from the top of its key range.
    fn scan_latest_sequence<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        room_id: u128,
    ) -> Result<Option<u64>, StorageError> {
        let start_key = encode_message_key(room_id, 0);
        let end_key = encode_message_key(room_id, u64::MAX);

        let mut results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        // Keys sort lexicographically and the layout is big-endian, so the
        // last key in the range carries the highest sequence.
        match results.next_back() {
            Some(result) => {
                let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                let (_, sequence) = decode_message_key(key.value())?;
                Ok(Some(sequence))
            },
            None => Ok(None),
        }
    }
}

impl Storage for RedbStorage {
    fn append_message(&self, room_id: u128, record: &MessageRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut messages =
                txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut index =
                txn.open_table(MESSAGE_INDEX).map_err(|e| StorageError::Io(e.to_string()))?;

            let expected = Self::scan_latest_sequence(&messages, room_id)?.map_or(1, |s| s + 1);
            if record.sequence != expected {
                return Err(StorageError::Conflict { expected, got: record.sequence });
            }

            let stored = StoredMessage { record: record.clone(), deleted: false };
            let mut bytes = Vec::new();
            ciborium::into_writer(&stored, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            let key = encode_message_key(room_id, record.sequence);
            messages
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;

            let index_key = encode_message_key(room_id, record.id);
            index
                .insert(index_key.as_slice(), record.sequence.to_be_bytes().as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn latest_sequence(&self, room_id: u128) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        Self::scan_latest_sequence(&table, room_id)
    }

    fn load_history(
        &self,
        room_id: u128,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        // The upper bound is exclusive: sequence u64::MAX is never assigned
        // (the sequencer overflows first), so `None` still covers the whole
        // log.
        let start_key = encode_message_key(room_id, 0);
        let end_key = encode_message_key(room_id, before_sequence.unwrap_or(u64::MAX));

        let results = table
            .range(start_key.as_slice()..end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut records = Vec::new();
        for result in results.rev() {
            if records.len() >= limit {
                break;
            }

            let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let stored: StoredMessage = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            if stored.deleted {
                continue;
            }
            records.push(stored.record);
        }

        Ok(records)
    }

    fn load_message(
        &self,
        room_id: u128,
        message_id: u64,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let index = txn.open_table(MESSAGE_INDEX).map_err(|e| StorageError::Io(e.to_string()))?;

        let index_key = encode_message_key(room_id, message_id);
        let Some(sequence_value) =
            index.get(index_key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?
        else {
            return Ok(None);
        };
        let sequence = decode_sequence_value(sequence_value.value())?;

        let messages = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
        let key = encode_message_key(room_id, sequence);
        match messages.get(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => {
                let stored: StoredMessage = ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(stored))
            },
            None => Err(StorageError::Serialization(format!(
                "message index for {message_id} points at missing sequence {sequence}"
            ))),
        }
    }

    fn tombstone_message(&self, room_id: u128, message_id: u64) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let index =
                txn.open_table(MESSAGE_INDEX).map_err(|e| StorageError::Io(e.to_string()))?;

            let index_key = encode_message_key(room_id, message_id);
            let Some(sequence_value) =
                index.get(index_key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?
            else {
                return Ok(false);
            };
            let sequence = decode_sequence_value(sequence_value.value())?;
            drop(sequence_value);
            drop(index);

            let mut messages =
                txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = encode_message_key(room_id, sequence);
            let mut stored: StoredMessage = match messages
                .get(key.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?
            {
                Some(value) => ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
                None => {
                    return Err(StorageError::Serialization(format!(
                        "message index for {message_id} points at missing sequence {sequence}"
                    )));
                },
            };

            stored.deleted = true;
            let mut bytes = Vec::new();
            ciborium::into_writer(&stored, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            messages
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(true)
    }

    fn create_room(&self, definition: &RoomDefinition) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = encode_room_key(definition.id);

            if table.get(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?.is_some() {
                return Ok(()); // Already exists, don't overwrite
            }

            let mut bytes = Vec::new();
            ciborium::into_writer(definition, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn update_room(&self, definition: &RoomDefinition) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut bytes = Vec::new();
            ciborium::into_writer(definition, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            let key = encode_room_key(definition.id);
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_room(&self, room_id: u128) -> Result<Option<RoomDefinition>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;

        let table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

        let key = encode_room_key(room_id);

        match table.get(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => {
                let definition: RoomDefinition = ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(definition))
            },
            None => Ok(None),
        }
    }

    fn list_rooms(&self) -> Result<Vec<u128>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;

        let table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut rooms = Vec::new();

        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let bytes: [u8; 16] = key.value().try_into().map_err(|_| {
                StorageError::Serialization("room key must be 16 bytes".to_string())
            })?;
            rooms.push(u128::from_be_bytes(bytes));
        }

        Ok(rooms)
    }
}

/// Encode (room_id, sequence-or-id) as 24-byte big-endian key.
///
/// Layout: [room_id: 16 bytes BE][discriminant: 8 bytes BE]
/// This ensures lexicographic ordering matches numeric ordering.
fn encode_message_key(room_id: u128, discriminant: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(&room_id.to_be_bytes());
    key[16..].copy_from_slice(&discriminant.to_be_bytes());
    key
}

/// Decode a message key back to (room_id, sequence).
fn decode_message_key(key: &[u8]) -> Result<(u128, u64), StorageError> {
    if key.len() != 24 {
        return Err(StorageError::Serialization(format!(
            "message key must be 24 bytes, got {}",
            key.len()
        )));
    }
    let room_id = key[..16]
        .try_into()
        .map(u128::from_be_bytes)
        .map_err(|_| StorageError::Serialization("message key room slice".to_string()))?;
    let sequence = key[16..]
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StorageError::Serialization("message key sequence slice".to_string()))?;
    Ok((room_id, sequence))
}

/// Decode an index value (8-byte big-endian sequence).
fn decode_sequence_value(value: &[u8]) -> Result<u64, StorageError> {
    value
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StorageError::Serialization("sequence value must be 8 bytes".to_string()))
}

/// Encode room_id as 16-byte big-endian key.
fn encode_room_key(room_id: u128) -> [u8; 16] {
    room_id.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use parlor_proto::payloads::room::{MessageKind, RoomKind};
    use tempfile::tempdir;

    use super::*;

    fn record(id: u64, sequence: u64, content: &str) -> MessageRecord {
        MessageRecord {
            id,
            sender_id: 1,
            sequence,
            kind: MessageKind::Text,
            content: content.to_string(),
            reply_to: None,
            mentions: Vec::new(),
            created_at_ms: 1000 + sequence,
        }
    }

    fn topic_room(id: u128) -> RoomDefinition {
        RoomDefinition {
            id,
            kind: RoomKind::Topic,
            capacity: 100,
            private: false,
            creator: 1,
            allow_list: BTreeSet::new(),
        }
    }

    #[test]
    fn message_key_encoding_round_trips() {
        let room_id: u128 = 0x1234_5678_9ABC_DEF0_FEDC_BA98_7654_3210;
        let sequence: u64 = 42;

        let key = encode_message_key(room_id, sequence);
        assert_eq!(key.len(), 24);

        let (decoded_room, decoded_sequence) = decode_message_key(&key).unwrap();
        assert_eq!(decoded_room, room_id);
        assert_eq!(decoded_sequence, sequence);
    }

    #[test]
    fn append_sequential_and_latest() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for seq in 1..=3 {
            storage.append_message(100, &record(seq, seq, "msg")).unwrap();
        }

        assert_eq!(storage.latest_sequence(100).unwrap(), Some(3));
    }

    #[test]
    fn append_gap_is_a_conflict() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.append_message(100, &record(1, 1, "first")).unwrap();

        let result = storage.append_message(100, &record(2, 3, "gap"));
        assert_eq!(result, Err(StorageError::Conflict { expected: 2, got: 3 }));

        // The conflicting transaction aborted; the log is unchanged.
        assert_eq!(storage.latest_sequence(100).unwrap(), Some(1));
    }

    #[test]
    fn empty_room_has_no_latest_sequence() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert_eq!(storage.latest_sequence(999).unwrap(), None);
    }

    #[test]
    fn history_pages_newest_first() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for seq in 1..=20 {
            storage.append_message(100, &record(seq, seq, "msg")).unwrap();
        }

        let page1 = storage.load_history(100, None, 10).unwrap();
        let sequences: Vec<_> = page1.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (11..=20).rev().collect::<Vec<_>>());

        let page2 = storage.load_history(100, Some(11), 10).unwrap();
        let sequences: Vec<_> = page2.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (1..=10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn history_excludes_tombstones_and_other_rooms() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for seq in 1..=5 {
            storage.append_message(100, &record(seq, seq, "a")).unwrap();
        }
        storage.append_message(200, &record(50, 1, "b")).unwrap();

        assert!(storage.tombstone_message(100, 3).unwrap());

        let history = storage.load_history(100, None, 10).unwrap();
        let sequences: Vec<_> = history.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![5, 4, 2, 1]);
    }

    #[test]
    fn load_message_by_id_uses_the_index() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.append_message(100, &record(777, 1, "indexed")).unwrap();

        let stored = storage.load_message(100, 777).unwrap().unwrap();
        assert_eq!(stored.record.content, "indexed");
        assert!(!stored.deleted);

        assert!(storage.load_message(100, 778).unwrap().is_none());
        assert!(!storage.tombstone_message(100, 778).unwrap());
    }

    #[test]
    fn create_room_is_idempotent_and_update_overwrites() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let mut def = topic_room(5);
        storage.create_room(&def).unwrap();

        let mut altered = def.clone();
        altered.capacity = 1;
        storage.create_room(&altered).unwrap();
        assert_eq!(storage.load_room(5).unwrap().unwrap().capacity, 100);

        def.allow_list.insert(42);
        storage.update_room(&def).unwrap();
        assert!(storage.load_room(5).unwrap().unwrap().allow_list.contains(&42));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.create_room(&topic_room(7)).unwrap();
            storage.append_message(7, &record(1, 1, "persisted")).unwrap();
            storage.append_message(7, &record(2, 2, "gone")).unwrap();
            assert!(storage.tombstone_message(7, 2).unwrap());
        }

        let reopened = RedbStorage::open(&path).unwrap();
        assert_eq!(reopened.list_rooms().unwrap(), vec![7]);
        assert_eq!(reopened.latest_sequence(7).unwrap(), Some(2));

        let history = reopened.load_history(7, None, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "persisted");

        let tombstoned = reopened.load_message(7, 2).unwrap().unwrap();
        assert!(tombstoned.deleted);
    }
}
