//! Per-room read receipts.
//!
//! Append-only: the first time a user marks a message read it is recorded
//! and announced, every later mark of the same message by the same user is
//! a silent no-op. Receipts are live room state and are not persisted.

use std::collections::HashMap;

use parlor_proto::payloads::reactions::{ReadEntry, ReceiptEvent};

use crate::room::UserId;

/// Read receipts for one room, keyed by message.
///
/// Reader lists keep first-read order, matching how clients display
/// "seen by" rows.
#[derive(Debug, Default)]
pub struct ReceiptLog {
    by_message: HashMap<u64, Vec<ReadEntry>>,
}

impl ReceiptLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `user_id` read a message.
    ///
    /// Returns the event to broadcast on first read, `None` on repeats.
    pub fn mark(&mut self, message_id: u64, user_id: UserId, now_ms: u64) -> Option<ReceiptEvent> {
        let readers = self.by_message.entry(message_id).or_default();
        if readers.iter().any(|entry| entry.user_id == user_id) {
            return None;
        }
        readers.push(ReadEntry { user_id, read_at_ms: now_ms });
        Some(ReceiptEvent { message_id, user_id, read_at_ms: now_ms })
    }

    /// Users that read a message, in first-read order.
    pub fn readers(&self, message_id: u64) -> &[ReadEntry] {
        self.by_message.get(&message_id).map_or(&[], Vec::as_slice)
    }

    /// Whether `user_id` already read the message.
    pub fn has_read(&self, message_id: u64, user_id: UserId) -> bool {
        self.readers(message_id).iter().any(|entry| entry.user_id == user_id)
    }

    /// Drops receipts for a deleted message.
    pub fn remove_message(&mut self, message_id: u64) {
        self.by_message.remove(&message_id);
    }

    /// Whether the log holds no receipts.
    pub fn is_empty(&self) -> bool {
        self.by_message.is_empty()
    }
}
