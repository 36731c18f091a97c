//! Frame type combining header and payload.
//!
//! A `Frame` is the transport-layer packet consisting of:
//! - 64-byte raw binary header (Big Endian) for O(1) routing
//! - Variable-length raw bytes (already CBOR-encoded)
//!
//! This is a pure data holder (header + bytes). For high-level logic,
//! see `Payload::into_frame()` and `Payload::from_frame()`.

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame (transport layer).
///
/// Layout on the wire:
/// `[FrameHeader: 64 bytes, raw binary] + [payload: variable bytes]`
///
/// Holds raw bytes, NOT the Payload enum. The server can route frames to a
/// room worker without deserializing the payload.
///
/// # Invariants
///
/// - Size Consistency: `payload.len()` MUST match `header.payload_size()`.
///   Enforced by [`Frame::new`] and verified by [`Frame::decode`].
///
/// - Size Limit: `payload.len()` MUST NOT exceed
///   [`FrameHeader::MAX_PAYLOAD_SIZE`] (1 MiB). Violations are rejected
///   during decoding and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header (64 bytes)
    pub header: FrameHeader,

    /// Raw payload bytes (already CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with automatic `payload_size` calculation.
    ///
    /// The header's `payload_size` field is set to match the actual payload
    /// length, so a constructed frame can never desynchronize header claim
    /// and payload.
    ///
    /// Does NOT validate against [`FrameHeader::MAX_PAYLOAD_SIZE`];
    /// oversized frames are rejected later in [`Frame::encode`], which
    /// keeps construction infallible for tests and inspection.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        // INVARIANT: Payload length always fits in u32 because Bytes is
        // bounded by isize::MAX and the protocol cap (1 MiB) is far below
        // u32::MAX.
        #[allow(clippy::expect_used)]
        let payload_len = u32::try_from(payload.len())
            .expect("invariant: payload length fits in u32 (bounded by protocol limit)");

        header.payload_size = payload_len.to_be_bytes();

        debug_assert_eq!(header.payload_size(), payload_len);

        Self { header, payload }
    }

    /// Encode frame into buffer.
    ///
    /// Writes: `[header (64 bytes)] + [payload (variable)]`
    ///
    /// This is the enforcement point for the 1 MiB payload cap.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if payload exceeds the cap
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode frame from wire format.
    ///
    /// Returns a Frame with raw bytes (does NOT deserialize the payload).
    /// Use `Payload::from_frame()` for the high-level enum. All validation
    /// happens before the payload is copied; trailing bytes after the
    /// claimed payload length are ignored.
    ///
    /// # Errors
    ///
    /// - `ProtocolError` if header parsing fails (magic, version, size cap)
    /// - `ProtocolError::FrameTruncated` if the payload is shorter than the
    ///   header claims
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE.checked_add(payload_size).ok_or({
            ProtocolError::PayloadTooLarge {
                size: payload_size,
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            }
        })?;

        debug_assert!(total_size >= FrameHeader::SIZE);

        if bytes.len() < total_size {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        }

        // INVARIANT: bytes.len() >= total_size was checked above, and
        // total_size = FrameHeader::SIZE + payload_size (checked add), so
        // this slice cannot be out of bounds.
        #[allow(clippy::expect_used)]
        let payload = Bytes::copy_from_slice(
            bytes.get(FrameHeader::SIZE..total_size).expect("invariant: bounds checked above"),
        );

        debug_assert_eq!(payload.len(), payload_size);

        Ok(Self { header: *header, payload })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::Opcode;

    impl Arbitrary for Frame {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (any::<FrameHeader>(), any::<Vec<u8>>())
                .prop_map(|(header, payload_bytes)| Self::new(header, payload_bytes))
                .boxed()
        }
    }

    proptest! {
        #[test]
        fn frame_round_trip(frame in any::<Frame>()) {
            let mut wire = Vec::new();
            frame.encode(&mut wire).expect("should encode");

            let parsed = Frame::decode(&wire).expect("should decode");
            prop_assert_eq!(frame.payload, parsed.payload);
        }
    }

    #[test]
    fn frame_with_payload() {
        let mut header = FrameHeader::new(Opcode::Ping);
        header.set_room_id(9);

        // Create frame (payload_size set automatically)
        let payload_bytes = vec![1, 2, 3, 4];
        let frame = Frame::new(header, payload_bytes.clone());

        let expected_size = payload_bytes.len() as u32;
        assert_eq!(frame.header.payload_size(), expected_size);

        // Encode and decode
        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        let parsed = Frame::decode(&wire).expect("should decode");
        assert_eq!(frame.payload, parsed.payload);
        assert_eq!(parsed.header.room_id(), 9);
    }

    #[test]
    fn reject_truncated_frame() {
        // Create header claiming 100 bytes of payload
        let mut header = FrameHeader::new(Opcode::RoomMessage);
        header.set_payload_size(100);

        let header_bytes = header.to_bytes();

        // Only provide header, no payload
        let result = Frame::decode(&header_bytes);
        assert!(matches!(result, Err(ProtocolError::FrameTruncated { .. })));
    }

    #[test]
    fn trailing_bytes_ignored() {
        let frame = Frame::new(FrameHeader::new(Opcode::Pong), vec![7u8; 3]);

        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");
        wire.extend_from_slice(&[0xAA; 10]);

        let parsed = Frame::decode(&wire).expect("should decode");
        assert_eq!(parsed.payload.len(), 3);
    }
}
