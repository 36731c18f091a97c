//! Frame header implementation with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 64-byte structure serialized as raw binary
//! (Big Endian). Routing decisions (which room worker, which session) are
//! made from the header alone, without deserializing the CBOR payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 64-byte frame header (Big Endian network byte order).
///
/// All multi-byte integers are stored in Big Endian format to match network
/// byte order. Fields are stored as raw byte arrays to avoid alignment
/// issues, so the struct can be cast directly from untrusted network bytes:
/// every 64-byte pattern is a structurally valid header candidate, and
/// validation happens in [`Self::from_bytes`].
///
/// The header fits exactly one 64-byte CPU cache line, so the hot routing
/// path (opcode + room id + sender id) touches a single line per frame.
///
/// The `context_id` field is opcode-dependent:
/// - `RoomMessageEvent`: the assigned room sequence number.
/// - `DirectMessage` / `TypingDm`: the recipient user id.
/// - All other opcodes: zero.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (8 bytes: 0-7)
    magic: [u8; 4],             // 0x5041524C ("PARL" in ASCII)
    version: u8,                // 0x01
    flags: u8,                  // reserved, zero on the wire
    pub(crate) opcode: [u8; 2], // u16 operation code

    // Request/payload metadata (8 bytes: 8-15)
    request_id: [u8; 4], // u32 client submission token (0 for server events)
    pub(crate) payload_size: [u8; 4], // u32 payload length

    // Routing context (24 bytes: 16-39)
    room_id: [u8; 16],  // 128-bit room identifier
    sender_id: [u8; 8], // u64 sender user id (0 before authentication)

    // Ordering/targeting context (16 bytes: 40-55)
    context_id: [u8; 8],    // opcode-dependent: sequence or target user id
    timestamp_ms: [u8; 8],  // u64 sender wall clock, Unix milliseconds

    // Reserved (8 bytes: 56-63)
    reserved: [u8; 8],
}

impl FrameHeader {
    /// Size of the serialized header (64 bytes).
    /// Fits exactly into one 64-byte CPU cache line.
    pub const SIZE: usize = 64;

    /// Magic number: "PARL" in ASCII (0x5041524C).
    pub const MAGIC: u32 = 0x5041_524C;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (1 MiB).
    ///
    /// Chat payloads are small; anything near this limit indicates a broken
    /// or hostile peer. Attachments travel out-of-band as URLs.
    pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

    /// Create a new header with the specified opcode.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&Self::MAGIC.to_be_bytes());
        bytes[4] = Self::VERSION;
        bytes[6..8].copy_from_slice(&opcode.to_u16().to_be_bytes());

        // SAFETY: We just constructed valid bytes with correct magic and
        // version. from_bytes will validate these and return a valid header.
        Self::from_bytes(&bytes)
            .ok()
            .unwrap_or_else(|| unreachable!("constructed valid header with correct magic/version"))
            .to_owned()
    }

    /// Parse header from network bytes (zero-copy, safe).
    ///
    /// Casts raw bytes directly to a `FrameHeader` reference using
    /// compile-time layout verification from `zerocopy`. No data is copied.
    /// Validation runs cheapest-first: length, magic, version, payload size.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if buffer is shorter than 64 bytes
    /// - `ProtocolError::InvalidMagic` if the magic number is wrong
    /// - `ProtocolError::UnsupportedVersion` on a version mismatch
    /// - `ProtocolError::PayloadTooLarge` if the claimed size exceeds the cap
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes (zero-copy).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol magic number (0x5041524C = "PARL").
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte (currently 0x01).
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Reserved flags byte. Zero in the current protocol version.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Client-assigned submission token for request/response correlation.
    ///
    /// Echoed back in the matching `Ack` or `Error` frame so clients can
    /// reconcile optimistic local state without guessing server-assigned
    /// ids. Zero on server-originated events.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes(self.request_id)
    }

    /// 128-bit room identifier.
    #[must_use]
    pub fn room_id(&self) -> u128 {
        u128::from_be_bytes(self.room_id)
    }

    /// Stable sender user id (assigned during handshake).
    #[must_use]
    pub fn sender_id(&self) -> u64 {
        u64::from_be_bytes(self.sender_id)
    }

    /// Room sequence number assigned by the message router.
    ///
    /// Only meaningful for sequenced opcodes (`RoomMessageEvent`). For
    /// directed frames, use [`Self::target_id()`] instead.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        debug_assert!(
            !self.opcode_enum().is_some_and(Opcode::carries_target),
            "sequence() called on a directed frame - use target_id() instead"
        );
        u64::from_be_bytes(self.context_id)
    }

    /// Target user id for directed frames (`DirectMessage`, `TypingDm`).
    ///
    /// For sequenced frames, use [`Self::sequence()`] instead.
    #[must_use]
    pub fn target_id(&self) -> u64 {
        debug_assert!(
            self.opcode_enum().is_some_and(Opcode::carries_target),
            "target_id() called on a non-directed frame - use sequence() instead"
        );
        u64::from_be_bytes(self.context_id)
    }

    /// Sender wall clock in Unix milliseconds. Informational only; servers
    /// never order by it.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        u64::from_be_bytes(self.timestamp_ms)
    }

    /// Payload size in bytes (max 1 MiB).
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Update room identifier.
    pub fn set_room_id(&mut self, room_id: u128) {
        self.room_id = room_id.to_be_bytes();
    }

    /// Assign the room sequence number (message router use only).
    ///
    /// Only valid for sequenced opcodes. For directed frames, use
    /// [`Self::set_target_id()`].
    pub fn set_sequence(&mut self, sequence: u64) {
        debug_assert!(
            !self.opcode_enum().is_some_and(Opcode::carries_target),
            "set_sequence() called on a directed frame - use set_target_id() instead"
        );
        self.context_id = sequence.to_be_bytes();
    }

    /// Set the target user id for directed frames.
    ///
    /// Only valid for `DirectMessage` and `TypingDm`. For sequenced frames,
    /// use [`Self::set_sequence()`].
    pub fn set_target_id(&mut self, target_id: u64) {
        debug_assert!(
            self.opcode_enum().is_some_and(Opcode::carries_target),
            "set_target_id() called on a non-directed frame - use set_sequence() instead"
        );
        self.context_id = target_id.to_be_bytes();
    }

    /// Update sender user id.
    pub fn set_sender_id(&mut self, sender_id: u64) {
        self.sender_id = sender_id.to_be_bytes();
    }

    /// Set client submission token for response correlation.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id.to_be_bytes();
    }

    /// Set sender wall clock timestamp.
    pub fn set_timestamp_ms(&mut self, timestamp_ms: u64) {
        self.timestamp_ms = timestamp_ms.to_be_bytes();
    }

    /// Set payload size.
    pub fn set_payload_size(&mut self, size: u32) {
        self.payload_size = size.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let context_value = u64::from_be_bytes(self.context_id);
        let context_label = if self.opcode_enum().is_some_and(Opcode::carries_target) {
            "target_id"
        } else {
            "sequence"
        };

        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("request_id", &self.request_id())
            .field("room_id", &format!("{:#034x}", self.room_id()))
            .field("sender_id", &self.sender_id())
            .field(context_label, &context_value)
            .field("timestamp_ms", &self.timestamp_ms())
            .field("payload_size", &self.payload_size())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arbitrary_bytes<const N: usize>() -> impl Strategy<Value = [u8; N]> {
        prop::collection::vec(any::<u8>(), N).prop_map(|v| {
            let mut arr = [0u8; N];
            arr.copy_from_slice(&v);
            arr
        })
    }

    impl Arbitrary for FrameHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (
                arbitrary_bytes::<2>(),        // opcode
                arbitrary_bytes::<4>(),        // request_id (u32)
                arbitrary_bytes::<16>(),       // room_id
                arbitrary_bytes::<8>(),        // sender_id
                arbitrary_bytes::<8>(),        // context_id
                arbitrary_bytes::<8>(),        // timestamp_ms
                0u32..=Self::MAX_PAYLOAD_SIZE, // payload_size
            )
                .prop_map(
                    |(
                        opcode,
                        request_id,
                        room_id,
                        sender_id,
                        context_id,
                        timestamp_ms,
                        payload_size,
                    )| {
                        Self {
                            magic: Self::MAGIC.to_be_bytes(),
                            version: Self::VERSION,
                            flags: 0,
                            opcode,
                            request_id,
                            payload_size: payload_size.to_be_bytes(),
                            room_id,
                            sender_id,
                            context_id,
                            timestamp_ms,
                            reserved: [0u8; 8],
                        }
                    },
                )
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
        assert_eq!(FrameHeader::SIZE, 64);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<FrameHeader>()) {
            let bytes = header.to_bytes();
            let parsed = FrameHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn header_accessors(header in any::<FrameHeader>()) {
            prop_assert_eq!(header.magic(), FrameHeader::MAGIC);
            prop_assert_eq!(header.version(), FrameHeader::VERSION);
            prop_assert!(header.payload_size() <= FrameHeader::MAX_PAYLOAD_SIZE);
        }
    }

    #[test]
    fn reject_short_buffer() {
        let short_buf = [0u8; 40];
        let result = FrameHeader::from_bytes(&short_buf);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 64, actual: 40 }));
    }

    #[test]
    fn reject_invalid_magic() {
        let mut buf = [0u8; 64];
        buf[0..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        buf[4] = FrameHeader::VERSION; // valid version

        let result = FrameHeader::from_bytes(&buf);
        assert_eq!(result, Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn reject_invalid_version() {
        let mut buf = [0u8; 64];
        buf[0..4].copy_from_slice(&FrameHeader::MAGIC.to_be_bytes());
        buf[4] = 0xFF; // invalid version

        let result = FrameHeader::from_bytes(&buf);
        assert_eq!(result, Err(ProtocolError::UnsupportedVersion(0xFF)));
    }

    #[test]
    fn reject_oversized_payload() {
        let mut buf = [0u8; 64];
        buf[0..4].copy_from_slice(&FrameHeader::MAGIC.to_be_bytes());
        buf[4] = FrameHeader::VERSION;

        // Set payload_size to exceed maximum (at offset 12-15)
        let oversized = FrameHeader::MAX_PAYLOAD_SIZE + 1;
        buf[12..16].copy_from_slice(&oversized.to_be_bytes());

        let result = FrameHeader::from_bytes(&buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn context_id_directed_accessors() {
        let mut header = FrameHeader::new(Opcode::DirectMessage);
        header.set_target_id(77);
        assert_eq!(header.target_id(), 77);

        let mut header = FrameHeader::new(Opcode::RoomMessageEvent);
        header.set_sequence(42);
        assert_eq!(header.sequence(), 42);
    }
}
