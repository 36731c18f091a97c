//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing or constructing wire frames.
///
/// These cover structural problems only (framing, sizes, encoding).
/// Semantic rejections (not a member, restricted, ...) travel as `Error`
/// frames with an [`crate::ErrorPayload`] body, not as `ProtocolError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer is too short to contain a frame header.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes actually available.
        actual: usize,
    },

    /// Header claims more payload bytes than the buffer holds.
    #[error("frame truncated: header claims {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload length claimed by the header.
        expected: usize,
        /// Payload bytes actually present.
        actual: usize,
    },

    /// Magic number does not identify this protocol.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Protocol version is not supported by this build.
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the hard size cap.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Size of the offending payload.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },

    /// Opcode value is not part of the protocol.
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// CBOR serialization failed.
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
