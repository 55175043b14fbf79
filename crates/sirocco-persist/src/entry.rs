//! Log entry codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sirocco_crypto::crc32;
use sirocco_types::Version;

use crate::PersistError;

/// Fixed part of an entry: version(8) + timestamp(8) + payload_len(4).
const FIXED_HEADER: usize = 20;
/// Trailer after the signature: sig_len is part of the variable region;
/// the crc is 4 bytes.
const CRC_LEN: usize = 4;

/// One record of the version log: a delivered version, the sender's
/// timestamp, the message payload, and this node's signature over the
/// entry when signed logs are enabled (empty otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub version: Version,
    pub timestamp: u64,
    pub payload: Bytes,
    pub signature: Bytes,
}

impl LogEntry {
    pub fn new(version: Version, timestamp: u64, payload: Bytes) -> Self {
        Self {
            version,
            timestamp,
            payload,
            signature: Bytes::new(),
        }
    }

    pub fn signed(version: Version, timestamp: u64, payload: Bytes, signature: Bytes) -> Self {
        Self {
            version,
            timestamp,
            payload,
            signature,
        }
    }

    /// The digest peers sign and verify for this entry: the encoded
    /// prefix without signature or CRC.
    pub fn signing_digest(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_HEADER + self.payload.len());
        buf.extend_from_slice(&(self.version.as_i64() as u64).to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Encoded size of this entry on disk.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER + self.payload.len() + 4 + self.signature.len() + CRC_LEN
    }

    /// Serializes the entry, including the CRC trailer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u64_le(self.version.as_i64() as u64);
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_u32_le(self.signature.len() as u32);
        buf.put_slice(&self.signature);
        let crc = crc32(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Attempts to parse one entry from the front of `data`.
    ///
    /// Returns the entry and its encoded length. `Ok(None)` means the
    /// buffer holds only a truncated suffix of an entry; the torn-tail
    /// case a crashed writer leaves behind. A CRC mismatch on a
    /// fully-present entry is real corruption and is an error.
    pub fn decode(data: &Bytes, offset: u64) -> Result<Option<(Self, usize)>, PersistError> {
        if data.len() < FIXED_HEADER + 4 {
            return Ok(None);
        }
        let mut cursor = &data[..];
        let version = Version::new(cursor.get_u64_le() as i64);
        let timestamp = cursor.get_u64_le();
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < payload_len + 4 {
            return Ok(None);
        }
        let payload = data.slice(FIXED_HEADER..FIXED_HEADER + payload_len);
        cursor.advance(payload_len);
        let sig_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < sig_len + CRC_LEN {
            return Ok(None);
        }
        let sig_start = FIXED_HEADER + payload_len + 4;
        let signature = data.slice(sig_start..sig_start + sig_len);
        cursor.advance(sig_len);
        let stored_crc = cursor.get_u32_le();

        let crc_end = sig_start + sig_len;
        let computed_crc = crc32(&data[..crc_end]);
        if stored_crc != computed_crc {
            return Err(PersistError::Corrupted {
                offset,
                reason: "CRC mismatch",
            });
        }
        Ok(Some((
            Self {
                version,
                timestamp,
                payload,
                signature,
            },
            crc_end + CRC_LEN,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_decode_round_trip() {
        let entry = LogEntry::signed(
            Version::new(7),
            123_456,
            Bytes::from_static(b"payload bytes"),
            Bytes::from_static(&[0xAB; 64]),
        );
        let encoded: Bytes = entry.encode().freeze();
        let (decoded, consumed) = LogEntry::decode(&encoded, 0).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn truncated_tail_is_not_corruption() {
        let entry = LogEntry::new(Version::new(1), 5, Bytes::from_static(b"abcdef"));
        let encoded: Bytes = entry.encode().freeze();
        for cut in 0..encoded.len() {
            let partial = encoded.slice(..cut);
            assert!(
                LogEntry::decode(&partial, 0).unwrap().is_none(),
                "cut at {cut} should read as a torn tail"
            );
        }
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let entry = LogEntry::new(Version::new(1), 5, Bytes::from_static(b"abcdef"));
        let mut raw = entry.encode();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let encoded: Bytes = raw.freeze();
        assert!(matches!(
            LogEntry::decode(&encoded, 0),
            Err(PersistError::Corrupted { .. })
        ));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_entries(
            version in 0i64..i64::MAX,
            timestamp in any::<u64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            signature in proptest::collection::vec(any::<u8>(), 0..96),
        ) {
            let entry = LogEntry::signed(
                Version::new(version),
                timestamp,
                Bytes::from(payload),
                Bytes::from(signature),
            );
            let encoded: Bytes = entry.encode().freeze();
            let (decoded, consumed) = LogEntry::decode(&encoded, 0).unwrap().unwrap();
            prop_assert_eq!(decoded, entry);
            prop_assert_eq!(consumed, encoded.len());
        }
    }
}
