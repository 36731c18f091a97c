//! Per-room message sequence assignment.
//!
//! Every accepted message gets the next value of a dense per-room counter,
//! assigned by the single worker that owns the room. Sequences start at 1
//! for a fresh room and resume after the highest stored sequence when a
//! room is reloaded at startup.

use crate::error::RoomError;
use crate::room::RoomId;

/// Monotonic sequence counter for one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    /// Counter for a room with no stored messages. First assignment is 1.
    pub fn fresh() -> Self {
        Self { next: 1 }
    }

    /// Counter that will hand out `next` first.
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Counter resuming after the highest sequence found in storage.
    pub fn resume_after(latest: Option<u64>) -> Self {
        Self { next: latest.map_or(1, |sequence| sequence.saturating_add(1)) }
    }

    /// Next sequence that will be assigned, without consuming it.
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Assigns the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns `SequenceOverflow` when the counter is exhausted. The last
    /// representable value is never handed out, so an assigned sequence
    /// always has a successor.
    pub fn assign(&mut self, room_id: RoomId) -> Result<u64, RoomError> {
        let sequence = self.next;
        self.next = sequence.checked_add(1).ok_or(RoomError::SequenceOverflow(room_id))?;
        Ok(sequence)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::fresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_room_starts_at_one() {
        let mut sequencer = Sequencer::fresh();
        assert_eq!(sequencer.assign(1).unwrap(), 1);
        assert_eq!(sequencer.assign(1).unwrap(), 2);
        assert_eq!(sequencer.assign(1).unwrap(), 3);
    }

    #[test]
    fn resume_continues_after_stored_history() {
        let mut sequencer = Sequencer::resume_after(Some(41));
        assert_eq!(sequencer.assign(1).unwrap(), 42);
    }

    #[test]
    fn resume_with_no_history_starts_at_one() {
        let mut sequencer = Sequencer::resume_after(None);
        assert_eq!(sequencer.assign(1).unwrap(), 1);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut sequencer = Sequencer::fresh();
        assert_eq!(sequencer.peek(), 1);
        assert_eq!(sequencer.peek(), 1);
        assert_eq!(sequencer.assign(1).unwrap(), 1);
        assert_eq!(sequencer.peek(), 2);
    }

    #[test]
    fn exhausted_counter_errors() {
        let mut sequencer = Sequencer::starting_at(u64::MAX);
        let err = sequencer.assign(0xabc).unwrap_err();
        assert_eq!(err, RoomError::SequenceOverflow(0xabc));
    }
}
