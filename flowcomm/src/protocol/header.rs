//! Fixed 16-byte message header.
//!
//! Layout (all fields little-endian `i32`/`u32`):
//!
//! | offset | field         |
//! |--------|---------------|
//! | 0      | source        |
//! | 4      | flags         |
//! | 8      | destination   |
//! | 12     | object count  |
//!
//! A count of `-1` marks a single non-list payload and `0` a body-less
//! end marker. The header appears only in the first buffer of a message.

use crate::types::{Flags, TaskId};

pub const HEADER_SIZE: usize = 16;

/// Object count of a single, non-list payload.
pub const SINGLE_OBJECT: i32 = -1;

/// Length prefix preceding every object in the body.
pub const FRAME_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub source: TaskId,
    pub flags: Flags,
    /// Routing path; the receiver maps it to a local target.
    pub destination: i32,
    pub count: i32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.source.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.destination.to_le_bytes());
        out[12..16].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    /// Parse the first `HEADER_SIZE` bytes. Returns `None` if `bytes` is
    /// shorter or the count is below `-1`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let field = |at: usize| -> Option<[u8; 4]> { bytes.get(at..at + 4)?.try_into().ok() };
        let header = Self {
            source: i32::from_le_bytes(field(0)?),
            flags: Flags::from_bits(u32::from_le_bytes(field(4)?)),
            destination: i32::from_le_bytes(field(8)?),
            count: i32::from_le_bytes(field(12)?),
        };
        (header.count >= SINGLE_OBJECT).then_some(header)
    }

    /// Number of length-prefixed objects in the body.
    pub fn object_count(&self) -> usize {
        match self.count {
            SINGLE_OBJECT => 1,
            n => n.max(0) as usize,
        }
    }

    pub fn is_single(&self) -> bool {
        self.count == SINGLE_OBJECT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let h = MessageHeader {
            source: 3,
            flags: Flags::END | Flags::ORIGIN_PARTIAL,
            destination: -7,
            count: 0,
        };
        let bytes = h.to_bytes();
        assert_eq!(&bytes[0..4], &3i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(-7i32).to_le_bytes());
        assert_eq!(MessageHeader::parse(&bytes), Some(h));
    }

    #[test]
    fn test_object_counts() {
        let mut h = MessageHeader {
            source: 0,
            flags: Flags::NONE,
            destination: 0,
            count: SINGLE_OBJECT,
        };
        assert_eq!(h.object_count(), 1);
        assert!(h.is_single());
        h.count = 0;
        assert_eq!(h.object_count(), 0);
        h.count = 12;
        assert_eq!(h.object_count(), 12);
    }

    #[test]
    fn test_short_or_invalid_header() {
        assert_eq!(MessageHeader::parse(&[0u8; 15]), None);
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[12..16].copy_from_slice(&(-2i32).to_le_bytes());
        assert_eq!(MessageHeader::parse(&bytes), None);
    }
}
