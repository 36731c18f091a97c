//! Storage error types.

/// Errors from storage operations.
///
/// `Io` is transient (the caller may retry the command); `Serialization` and
/// `Conflict` indicate the caller or the stored data is out of step with the
/// log and need resynchronization, not a blind retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O or database engine failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Append skipped or repeated a sequence number.
    ///
    /// The log's next slot is `expected`; the caller tried to write `got`.
    /// The caller should reload the latest sequence and resync its counter.
    #[error("sequence conflict: expected {expected}, got {got}")]
    Conflict {
        /// Sequence the log would accept next.
        expected: u64,
        /// Sequence the caller tried to append.
        got: u64,
    },
}
