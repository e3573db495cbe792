//! Wire framing for length-prefixed messages.
//!
//! One framed message is a 9-byte header followed by `size` payload
//! bytes: bytes 0..8 carry `size` little-endian, byte 8 carries the
//! codec tag. The order is fixed regardless of host endianness; there
//! is no delimiter, checksum, or version field.

use bytes::{Buf, BufMut};

/// Size of the on-wire frame header in bytes.
pub const HEADER_SIZE: usize = 9;

/// Hard cap on a peer-announced payload size. A header above this is
/// rejected before any buffer is allocated.
pub const MAX_PAYLOAD_SIZE: u64 = 524_288_000;

/// Compression tag carried in the frame header.
///
/// The server copies this byte without interpreting it; only the
/// application layer decides what to do with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Lzma = 1,
    Gzip = 2,
    Lz4 = 3,
    Zstd = 4,
}

impl Codec {
    /// The on-wire tag byte.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Map a tag byte back to a known codec.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Codec::None),
            1 => Some(Codec::Lzma),
            2 => Some(Codec::Gzip),
            3 => Some(Codec::Lz4),
            4 => Some(Codec::Zstd),
            _ => None,
        }
    }
}

/// Parsed frame header.
///
/// `size` counts payload bytes only, excluding the header itself.
/// `codec` is the raw tag byte so unknown values pass through intact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u64,
    pub codec: u8,
}

impl FrameHeader {
    pub fn new(size: u64, codec: Codec) -> Self {
        Self {
            size,
            codec: codec.tag(),
        }
    }

    /// Serialize into a fixed 9-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut &mut buf[..]);
        buf
    }

    /// Write the header into any byte sink.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.size);
        buf.put_u8(self.codec);
    }

    /// Deserialize from the 9 staging bytes.
    pub fn decode(mut buf: &[u8]) -> Self {
        let size = buf.get_u64_le();
        let codec = buf.get_u8();
        Self { size, codec }
    }
}
