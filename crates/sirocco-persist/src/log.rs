//! The per-subgroup version log.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sirocco_types::{SubgroupId, Version};
use tracing::{debug, warn};

use crate::{LogEntry, PersistError};

/// Append-only log of delivered versions for one subgroup.
///
/// Appends are written and fsynced before returning, so an acknowledged
/// version is durable. Opening an existing log scans it front to back,
/// truncating a torn final entry if the previous writer died mid-append.
pub struct VersionLog {
    path: PathBuf,
    file: File,
    len: u64,
    last_version: Version,
    max_log_entry: u64,
    max_data_size: u64,
}

impl VersionLog {
    /// Opens (or creates) the log for `subgroup` under `dir`.
    ///
    /// With `reset`, any existing contents are discarded first.
    pub fn open(
        dir: &Path,
        subgroup: SubgroupId,
        reset: bool,
        max_log_entry: u64,
        max_data_size: u64,
    ) -> Result<Self, PersistError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("subgroup-{}.vlog", subgroup.as_u32()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(reset)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let contents = Bytes::from(contents);

        let mut offset = 0usize;
        let mut last_version = Version::INVALID;
        while offset < contents.len() {
            let rest = contents.slice(offset..);
            match LogEntry::decode(&rest, offset as u64)? {
                Some((entry, consumed)) => {
                    last_version = entry.version;
                    offset += consumed;
                }
                None => {
                    warn!(
                        path = %path.display(),
                        offset,
                        torn_bytes = contents.len() - offset,
                        "truncating torn tail of version log"
                    );
                    file.set_len(offset as u64)?;
                    file.sync_data()?;
                    break;
                }
            }
        }

        debug!(
            path = %path.display(),
            bytes = offset,
            last_version = %last_version,
            "opened version log"
        );
        Ok(Self {
            path,
            file,
            len: offset as u64,
            last_version,
            max_log_entry,
            max_data_size,
        })
    }

    /// Appends one entry and fsyncs. The entry's version must exceed the
    /// last appended version.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), PersistError> {
        if entry.version <= self.last_version {
            return Err(PersistError::NonMonotonicVersion {
                version: entry.version,
                previous: self.last_version,
            });
        }
        let encoded = entry.encode();
        if encoded.len() as u64 > self.max_log_entry {
            return Err(PersistError::EntryTooLarge {
                size: encoded.len() as u64,
                max: self.max_log_entry,
            });
        }
        if self.len + encoded.len() as u64 > self.max_data_size {
            return Err(PersistError::LogFull {
                max: self.max_data_size,
            });
        }
        self.file.write_all(&encoded)?;
        self.file.sync_data()?;
        self.len += encoded.len() as u64;
        self.last_version = entry.version;
        Ok(())
    }

    /// The highest durable version, or [`Version::INVALID`] for an
    /// empty log.
    pub fn last_version(&self) -> Version {
        self.last_version
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry back, oldest first. Used for state transfer to
    /// joiners and for restart after total failure.
    pub fn read_all(&mut self) -> Result<Vec<LogEntry>, PersistError> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        self.file.read_to_end(&mut contents)?;
        let contents = Bytes::from(contents);

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < contents.len() {
            let rest = contents.slice(offset..);
            match LogEntry::decode(&rest, offset as u64)? {
                Some((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                None => break,
            }
        }
        Ok(entries)
    }

    /// Reads back the entries with versions strictly above `from`.
    pub fn read_since(&mut self, from: Version) -> Result<Vec<LogEntry>, PersistError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.version > from)
            .collect())
    }

    /// Discards every entry with a version above `upto`. Restart uses
    /// this to cut a log back to the cluster-agreed recovery point
    /// before new versions are assigned.
    pub fn truncate_to(&mut self, upto: Version) -> Result<(), PersistError> {
        if self.last_version <= upto {
            return Ok(());
        }
        let mut keep_bytes = 0u64;
        let mut keep_last = Version::INVALID;
        for entry in self.read_all()? {
            if entry.version > upto {
                break;
            }
            keep_bytes += entry.encoded_len() as u64;
            keep_last = entry.version;
        }
        warn!(
            path = %self.path.display(),
            upto = %upto,
            dropped_bytes = self.len - keep_bytes,
            "truncating version log to recovery point"
        );
        self.file.set_len(keep_bytes)?;
        self.file.sync_data()?;
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::End(0))?;
        self.len = keep_bytes;
        self.last_version = keep_last;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(version: i64, payload: &'static [u8]) -> LogEntry {
        LogEntry::new(Version::new(version), version as u64 * 10, Bytes::from_static(payload))
    }

    #[test]
    fn append_then_reopen_recovers_versions() {
        let dir = tempdir().unwrap();
        let sg = SubgroupId::new(0);
        {
            let mut log = VersionLog::open(dir.path(), sg, false, 1 << 20, 1 << 30).unwrap();
            log.append(&entry(0, b"a")).unwrap();
            log.append(&entry(1, b"bb")).unwrap();
            log.append(&entry(2, b"ccc")).unwrap();
            assert_eq!(log.last_version(), Version::new(2));
        }
        let mut log = VersionLog::open(dir.path(), sg, false, 1 << 20, 1 << 30).unwrap();
        assert_eq!(log.last_version(), Version::new(2));
        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].payload.as_ref(), b"ccc");
    }

    #[test]
    fn reset_truncates() {
        let dir = tempdir().unwrap();
        let sg = SubgroupId::new(1);
        {
            let mut log = VersionLog::open(dir.path(), sg, false, 1 << 20, 1 << 30).unwrap();
            log.append(&entry(0, b"a")).unwrap();
        }
        let log = VersionLog::open(dir.path(), sg, true, 1 << 20, 1 << 30).unwrap();
        assert_eq!(log.last_version(), Version::INVALID);
        assert_eq!(log.len_bytes(), 0);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let sg = SubgroupId::new(2);
        let path;
        {
            let mut log = VersionLog::open(dir.path(), sg, false, 1 << 20, 1 << 30).unwrap();
            log.append(&entry(0, b"complete")).unwrap();
            path = log.path().to_path_buf();
        }
        // Simulate a crash mid-append: half an entry at the tail.
        let half: Vec<u8> = entry(1, b"torn").encode()[..10].to_vec();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&half).unwrap();
        drop(file);

        let mut log = VersionLog::open(dir.path(), sg, false, 1 << 20, 1 << 30).unwrap();
        assert_eq!(log.last_version(), Version::new(0));
        assert_eq!(log.read_all().unwrap().len(), 1);
        // The log is usable again after truncation.
        log.append(&entry(1, b"retry")).unwrap();
        assert_eq!(log.last_version(), Version::new(1));
    }

    #[test]
    fn version_monotonicity_enforced() {
        let dir = tempdir().unwrap();
        let mut log =
            VersionLog::open(dir.path(), SubgroupId::new(3), false, 1 << 20, 1 << 30).unwrap();
        log.append(&entry(5, b"x")).unwrap();
        assert!(matches!(
            log.append(&entry(5, b"y")),
            Err(PersistError::NonMonotonicVersion { .. })
        ));
    }

    #[test]
    fn oversized_entry_rejected() {
        let dir = tempdir().unwrap();
        let mut log =
            VersionLog::open(dir.path(), SubgroupId::new(4), false, 64, 1 << 30).unwrap();
        let big = LogEntry::new(Version::new(0), 0, Bytes::from(vec![0u8; 128]));
        assert!(matches!(
            log.append(&big),
            Err(PersistError::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn truncate_to_cuts_the_tail() {
        let dir = tempdir().unwrap();
        let mut log =
            VersionLog::open(dir.path(), SubgroupId::new(6), false, 1 << 20, 1 << 30).unwrap();
        for v in 0..6 {
            log.append(&entry(v, b"p")).unwrap();
        }
        log.truncate_to(Version::new(3)).unwrap();
        assert_eq!(log.last_version(), Version::new(3));
        assert_eq!(log.read_all().unwrap().len(), 4);
        // Appends resume cleanly after the cut.
        log.append(&entry(4, b"q")).unwrap();
        assert_eq!(log.last_version(), Version::new(4));
    }

    #[test]
    fn read_since_filters_versions() {
        let dir = tempdir().unwrap();
        let mut log =
            VersionLog::open(dir.path(), SubgroupId::new(5), false, 1 << 20, 1 << 30).unwrap();
        for v in 0..5 {
            log.append(&entry(v, b"p")).unwrap();
        }
        let tail = log.read_since(Version::new(2)).unwrap();
        let versions: Vec<i64> = tail.iter().map(|e| e.version.as_i64()).collect();
        assert_eq!(versions, vec![3, 4]);
    }
}
