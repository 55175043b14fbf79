//! # sirocco-crypto: checksums and version signatures
//!
//! Two small pieces:
//! - [`crc32`]: table-driven CRC32 (IEEE 802.3) used by the persistent
//!   log and wire codecs. Implemented in-crate; the polynomial has not
//!   changed since 1975 and an in-tree table keeps the dependency
//!   surface flat.
//! - [`sign`]: Ed25519 signing and verification over persisted versions,
//!   wrapping `ed25519-dalek` behind the two operations the engine needs.

mod crc32;
pub mod sign;

pub use crc32::{crc32, Crc32};
pub use sign::{KeyError, SigningIdentity, VerifyingIdentity, SIGNATURE_LENGTH};
