//! Restart metadata sidecar.
//!
//! Alongside the version logs, each node keeps a tiny record of the last
//! view it installed and the verified frontier it had reached per
//! subgroup. After a total failure this is the only information a node
//! has before any network activity, and the restart leader uses it to
//! pick the most up-to-date shard leaders for state transfer.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sirocco_types::{SubgroupId, Version, ViewId};

use crate::PersistError;

/// What a node remembers across a total failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RestartMeta {
    /// Last installed view id, or `None` if the node never installed one.
    pub last_vid: Option<ViewId>,
    /// Member node ids of the last installed view; the restart quorum
    /// is judged against this roster.
    pub last_members: Vec<u32>,
    /// Verified frontier per subgroup at the time of the last save.
    pub verified: BTreeMap<SubgroupId, Version>,
}

impl RestartMeta {
    fn file_path(dir: &Path) -> PathBuf {
        dir.join("restart-meta.bin")
    }

    /// Loads the metadata from `dir`, returning the default (nothing
    /// known) when the file does not exist.
    pub fn load(dir: &Path) -> Result<Self, PersistError> {
        let path = Self::file_path(dir);
        match fs::read(&path) {
            Ok(bytes) => Ok(postcard::from_bytes(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replaces the metadata in `dir` (write-then-rename).
    pub fn save(&self, dir: &Path) -> Result<(), PersistError> {
        fs::create_dir_all(dir)?;
        let bytes = postcard::to_allocvec(self)?;
        let tmp = dir.join("restart-meta.bin.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, Self::file_path(dir))?;
        Ok(())
    }

    pub fn verified_for(&self, subgroup: SubgroupId) -> Version {
        self.verified.get(&subgroup).copied().unwrap_or_default()
    }
}
