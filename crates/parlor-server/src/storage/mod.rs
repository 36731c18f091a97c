//! Storage abstraction for message logs and room definitions.
//!
//! Trait-based abstraction over the message history store. The trait is
//! synchronous (no async): every call completes with local I/O inside the
//! room worker that owns the room, so async plumbing would buy nothing.
//!
//! Storage is the single source of truth for message identity. A write that
//! fails means the message was not accepted and must not be fanned out.

mod error;
mod memory;
mod redb;

pub use error::StorageError;
pub use memory::MemoryStorage;
use parlor_core::room::RoomDefinition;
use parlor_proto::payloads::room::MessageRecord;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// A message as persisted, with its tombstone flag.
///
/// Tombstoned messages keep their log slot so sequence numbers stay dense,
/// but are excluded from history reads and future fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The message as accepted by the room router.
    pub record: MessageRecord,
    /// Whether a moderation delete has retracted the message.
    pub deleted: bool,
}

/// Storage abstraction for message logs and room definitions.
///
/// Must be Clone (handed to every room worker), Send + Sync (workers run on
/// separate tasks), and synchronous. Implementations share internal state via
/// Arc, so clones access the same underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock). Acceptable for the
/// in-memory test backend; the durable backend has no such primitive.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Append a message to the room's log.
    ///
    /// # Invariants
    ///
    /// - Pre: `record.sequence` must be exactly one past the latest stored
    ///   sequence (or 1 for an empty log).
    /// - Post: the record is persisted at its sequence slot.
    ///
    /// A violated precondition fails with [`StorageError::Conflict`], which
    /// signals the caller's sequence counter is out of sync with the log.
    fn append_message(&self, room_id: u128, record: &MessageRecord) -> Result<(), StorageError>;

    /// Latest sequence number stored for a room. `None` for an empty log.
    fn latest_sequence(&self, room_id: u128) -> Result<Option<u64>, StorageError>;

    /// Load history newest-first, excluding tombstoned messages.
    ///
    /// Returns up to `limit` records with sequence strictly below
    /// `before_sequence` (from the top of the log when `None`), ordered
    /// newest-first for cold-start rendering.
    fn load_history(
        &self,
        room_id: u128,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Load one message by id, tombstoned or not.
    ///
    /// Returns `None` if the room has no message with this id.
    fn load_message(
        &self,
        room_id: u128,
        message_id: u64,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// Mark a message deleted, keeping its log slot.
    ///
    /// Returns `false` if the message does not exist. Tombstoning an already
    /// tombstoned message succeeds and returns `true`.
    fn tombstone_message(&self, room_id: u128, message_id: u64) -> Result<bool, StorageError>;

    /// Persist a room definition at creation.
    ///
    /// Idempotent - if the room already exists, this is a no-op and the
    /// stored definition is kept untouched.
    fn create_room(&self, definition: &RoomDefinition) -> Result<(), StorageError>;

    /// Overwrite a room definition.
    ///
    /// Used when an admin edits the invite allow list. The room must already
    /// exist; writing a definition for an unknown room is not an error but
    /// creates it.
    fn update_room(&self, definition: &RoomDefinition) -> Result<(), StorageError>;

    /// Load a room definition.
    ///
    /// Returns `None` if the room was never created.
    fn load_room(&self, room_id: u128) -> Result<Option<RoomDefinition>, StorageError>;

    /// List all room ids.
    ///
    /// Scans the room table only, O(rooms). Used at startup to report what
    /// survived a restart. Order is not guaranteed.
    fn list_rooms(&self) -> Result<Vec<u128>, StorageError>;
}
