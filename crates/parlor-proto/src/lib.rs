//! Wire protocol for the Parlor realtime messaging server.
//!
//! Frames are a fixed 64-byte binary header (Big Endian, zero-copy parsed)
//! followed by a CBOR payload body. The header alone carries everything the
//! server needs for routing: opcode, room id, sender id, and the client's
//! submission token for command/acknowledgment correlation.
//!
//! Layers:
//! - [`FrameHeader`]: fixed header, validated structurally on parse
//! - [`Frame`]: header + raw payload bytes (transport unit)
//! - [`Payload`]: typed payload enum, CBOR-encoded per opcode
//!
//! This crate is transport-agnostic and does no I/O.

pub mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

/// ALPN protocol identifier negotiated during the QUIC handshake.
pub const ALPN_PROTOCOL: &[u8] = b"parlor/1";

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Payload};
