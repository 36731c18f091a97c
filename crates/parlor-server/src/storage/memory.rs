use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use parlor_core::room::RoomDefinition;
use parlor_proto::payloads::room::MessageRecord;

use super::{Storage, StorageError, StoredMessage};

/// In-memory storage implementation for testing and simulation.
///
/// Uses `HashMap` for room lookups and Vec for ordered message storage: the
/// record at index `i` carries sequence `i + 1`, so the log stays dense and
/// positional (tombstones keep their slot). All state is wrapped in
/// Arc<Mutex<>> to allow Clone and concurrent access. Thread-safe through
/// Mutex, but uses `lock().expect()` which will panic if the mutex is
/// poisoned - acceptable for test code. Lookup by message id is a reverse
/// scan, which favors the recent messages that deletes and reactions target.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Room definitions as persisted at creation
    rooms: HashMap<u128, RoomDefinition>,

    /// Messages organized by room, stored in sequence order
    messages: HashMap<u128, Vec<StoredMessage>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                rooms: HashMap::new(),
                messages: HashMap::new(),
            })),
        }
    }

    /// Number of rooms with a stored definition.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn room_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").rooms.len()
    }

    /// Total number of messages across all rooms, tombstones included.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.values().map(Vec::len).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn append_message(&self, room_id: u128, record: &MessageRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let log = inner.messages.entry(room_id).or_default();

        let expected = log.len() as u64 + 1;
        if record.sequence != expected {
            return Err(StorageError::Conflict { expected, got: record.sequence });
        }

        log.push(StoredMessage { record: record.clone(), deleted: false });

        debug_assert_eq!(log.len() as u64, record.sequence);

        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn latest_sequence(&self, room_id: u128) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .messages
            .get(&room_id)
            .and_then(|log| log.last())
            .map(|stored| stored.record.sequence))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn load_history(
        &self,
        room_id: u128,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(log) = inner.messages.get(&room_id) else {
            return Ok(Vec::new());
        };

        let records = log
            .iter()
            .rev()
            .filter(|stored| !stored.deleted)
            .filter(|stored| before_sequence.is_none_or(|before| stored.record.sequence < before))
            .take(limit)
            .map(|stored| stored.record.clone())
            .collect();

        Ok(records)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn load_message(
        &self,
        room_id: u128,
        message_id: u64,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .messages
            .get(&room_id)
            .and_then(|log| log.iter().rev().find(|stored| stored.record.id == message_id))
            .cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn tombstone_message(&self, room_id: u128, message_id: u64) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let Some(log) = inner.messages.get_mut(&room_id) else {
            return Ok(false);
        };

        match log.iter_mut().rev().find(|stored| stored.record.id == message_id) {
            Some(stored) => {
                stored.deleted = true;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn create_room(&self, definition: &RoomDefinition) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        inner.rooms.entry(definition.id).or_insert_with(|| definition.clone());

        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn update_room(&self, definition: &RoomDefinition) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        inner.rooms.insert(definition.id, definition.clone());

        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn load_room(&self, room_id: u128) -> Result<Option<RoomDefinition>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner.rooms.get(&room_id).cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn list_rooms(&self) -> Result<Vec<u128>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner.rooms.keys().copied().collect())
    }
}
