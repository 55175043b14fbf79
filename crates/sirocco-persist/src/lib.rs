//! # sirocco-persist: durable version logs
//!
//! One append-only log per subgroup, recording every delivered version
//! in order:
//!
//! ```text
//! [version:u64][timestamp:u64][payload_len:u32][payload][sig_len:u32][signature][crc32:u32]
//! ```
//!
//! All integers little-endian. The CRC32 trailer covers everything
//! before it. Appends are fsynced before they are acknowledged, so a
//! version reported persisted survives a crash. On open, the log is
//! scanned to the last intact entry; a torn final entry (power loss
//! mid-write) is truncated away rather than treated as corruption.
//!
//! A small sidecar file per node records the last installed view id and
//! the per-subgroup verified frontier, which the restart protocol reads
//! before any network activity.

mod entry;
mod log;
mod meta;

pub use entry::LogEntry;
pub use log::VersionLog;
pub use meta::RestartMeta;

use sirocco_types::Version;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persistence I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("log entry of {size} bytes exceeds max_log_entry {max}")]
    EntryTooLarge { size: u64, max: u64 },

    #[error("log would exceed max_data_size {max}")]
    LogFull { max: u64 },

    #[error("corrupted log entry at byte offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: &'static str },

    #[error("version {version} was appended after {previous}; versions must increase")]
    NonMonotonicVersion { version: Version, previous: Version },

    #[error("restart metadata is unreadable: {0}")]
    BadMeta(#[from] postcard::Error),
}
