//! The fixed multicast message header.
//!
//! Every multicast payload, on both the bulk and the small-message path,
//! begins with this header. The layout is fixed-size little-endian so a
//! receiver can parse it out of a raw slot or block buffer:
//!
//! ```text
//! [header_size:u32][index:i32][timestamp:u64][num_nulls:u32][cooked:u8][pad:3B][pad:u64]
//!       4B             4B          8B             4B            1B       3B       8B
//! ```
//!
//! `timestamp` is the sender's wall clock in nanoseconds at send time and
//! feeds the real-time stability frontier. A header with `num_nulls > 0`
//! is a null message: it reserves that many sequence slots without any
//! payload, used to pad out a sender's stream during a view-change drain.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Encoded size of [`MessageHeader`], in bytes.
pub const HEADER_SIZE: usize = 32;

/// Parsed form of the per-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageHeader {
    /// The sender's per-view message index.
    pub index: i32,
    /// Sender wall clock at send time, nanoseconds since the epoch.
    pub timestamp: u64,
    /// Number of sequence slots this message reserves without payload.
    /// Zero for ordinary messages.
    pub num_nulls: u32,
    /// True when the payload is an RPC-style message to be dispatched to
    /// a registered handler rather than the raw delivery callback.
    pub cooked: bool,
}

impl MessageHeader {
    pub fn new(index: i32, timestamp: u64, cooked: bool) -> Self {
        Self {
            index,
            timestamp,
            num_nulls: 0,
            cooked,
        }
    }

    /// Builds a null-message header reserving `num_nulls` slots.
    pub fn null(index: i32, timestamp: u64, num_nulls: u32) -> Self {
        Self {
            index,
            timestamp,
            num_nulls,
            cooked: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.num_nulls > 0
    }

    /// Writes the 32-byte encoding into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`]. Callers always
    /// reserve headered buffers, so this indicates a logic error.
    pub fn encode_into(&self, mut buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_SIZE, "header buffer too small");
        buf.put_u32_le(HEADER_SIZE as u32);
        buf.put_i32_le(self.index);
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.num_nulls);
        buf.put_u8(u8::from(self.cooked));
        buf.put_bytes(0, 3);
        buf.put_u64_le(0);
    }

    /// Returns the 32-byte encoding as an array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.encode_into(&mut out);
        out
    }

    /// Parses a header from the front of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        let header_size = buf.get_u32_le();
        if header_size != HEADER_SIZE as u32 {
            return Err(HeaderError::SizeMismatch { found: header_size });
        }
        let index = buf.get_i32_le();
        let timestamp = buf.get_u64_le();
        let num_nulls = buf.get_u32_le();
        let cooked_byte = buf.get_u8();
        let cooked = match cooked_byte {
            0 => false,
            1 => true,
            other => return Err(HeaderError::InvalidCookedFlag { byte: other }),
        };
        Ok(Self {
            index,
            timestamp,
            num_nulls,
            cooked,
        })
    }
}

/// Errors from parsing a [`MessageHeader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("buffer of {len} bytes is too short for a {HEADER_SIZE}-byte header")]
    Truncated { len: usize },

    #[error("header_size field is {found}, expected {HEADER_SIZE}")]
    SizeMismatch { found: u32 },

    #[error("cooked flag byte is {byte:#04x}, expected 0 or 1")]
    InvalidCookedFlag { byte: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_decode_round_trip() {
        let header = MessageHeader::new(42, 1_700_000_000_000_000_000, true);
        let bytes = header.encode();
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn null_header_round_trip() {
        let header = MessageHeader::null(7, 99, 5);
        assert!(header.is_null());
        let decoded = MessageHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.num_nulls, 5);
        assert!(!decoded.cooked);
    }

    #[test]
    fn truncated_buffer_rejected() {
        let header = MessageHeader::new(0, 0, false);
        let bytes = header.encode();
        assert!(matches!(
            MessageHeader::decode(&bytes[..HEADER_SIZE - 1]),
            Err(HeaderError::Truncated { .. })
        ));
    }

    #[test]
    fn bad_cooked_byte_rejected() {
        let mut bytes = MessageHeader::new(0, 0, false).encode();
        bytes[20] = 3;
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(HeaderError::InvalidCookedFlag { byte: 3 })
        ));
    }

    proptest! {
        #[test]
        fn round_trip_all_fields(
            index in any::<i32>(),
            timestamp in any::<u64>(),
            num_nulls in any::<u32>(),
            cooked in any::<bool>(),
        ) {
            let header = MessageHeader { index, timestamp, num_nulls, cooked };
            let decoded = MessageHeader::decode(&header.encode()).unwrap();
            prop_assert_eq!(decoded, header);
        }
    }
}
