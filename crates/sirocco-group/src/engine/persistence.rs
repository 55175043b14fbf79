//! The persistence thread and the durability/verification frontiers.
//!
//! Delivery hands `(version, timestamp, payload)` tuples to one
//! persistence thread per engine. The thread appends to the
//! per-subgroup version log (fsynced), signs the entry when signing is
//! configured, and publishes `persisted_num` / `signed_num` / the
//! signature bytes in our table row. Failed appends are retried with
//! exponential backoff. Persistent failure is fatal for the local node
//! only: it raises `rip` and stops, leaving the rest of the shard
//! intact.
//!
//! Two predicate-side passes complete the picture: `min_persisted`
//! folds the shard's `persisted_num` columns into the global
//! persistence frontier, and the verification pass checks each peer's
//! published signature against our own log's digest for the same
//! version before advancing `verified_num`.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use sirocco_persist::{LogEntry, RestartMeta, VersionLog};
use sirocco_sst::{PredicateHandle, PredicateKind};
use sirocco_types::{SubgroupId, Version};
use tracing::{debug, error, info, warn};

use super::{EngineConfig, EngineShared, PersistCommand};

const APPEND_ATTEMPTS: u32 = 4;
const APPEND_BACKOFF: Duration = Duration::from_millis(10);

pub(super) fn spawn_persistence_thread(
    shared: Arc<EngineShared>,
    rx: Receiver<PersistCommand>,
    config: &EngineConfig,
) -> Result<JoinHandle<()>, crate::GroupError> {
    let mut logs: BTreeMap<SubgroupId, VersionLog> = BTreeMap::new();
    for subgroup in shared.settings.keys() {
        let log = VersionLog::open(
            &config.persist_dir,
            *subgroup,
            config.persist_reset,
            config.max_log_entry,
            config.max_data_size,
        )?;
        // Recover the durable frontier into our row up front: versions
        // already in the log survived whatever brought us here.
        let durable = log.last_version();
        if durable.is_valid() {
            let column = shared.column(*subgroup);
            shared.sst.write_local(|row| row.persisted_num[column] = durable);
        }
        logs.insert(*subgroup, log);
    }
    let _ = shared.sst.push_row_except_slots();
    let persist_dir = config.persist_dir.clone();

    let handle = std::thread::Builder::new()
        .name("engine-persist".to_string())
        .spawn(move || {
            while let Ok(cmd) = rx.recv() {
                match cmd {
                    PersistCommand::Shutdown => break,
                    PersistCommand::Version {
                        subgroup,
                        version,
                        timestamp,
                        payload,
                    } => {
                        let log = logs.get_mut(&subgroup).expect("log opened per subgroup");
                        let mut entry = LogEntry::new(version, timestamp, payload);
                        let digest = entry.signing_digest();
                        let signature = shared
                            .signer
                            .as_ref()
                            .map(|signer| signer.sign(&digest).to_vec());
                        if let Some(sig) = &signature {
                            entry.signature = sig.clone().into();
                        }

                        if !append_with_backoff(log, &entry) {
                            fatal_persistence_failure(&shared, subgroup, version);
                            break;
                        }

                        publish_durability(&shared, subgroup, version, &digest, signature);
                        save_restart_meta(&shared, &persist_dir);
                    }
                }
            }
            // Final metadata snapshot so a restart sees our last word.
            save_restart_meta(&shared, &persist_dir);
            debug!("persistence thread exiting");
        })
        .expect("failed to spawn persistence thread");
    Ok(handle)
}

fn append_with_backoff(log: &mut VersionLog, entry: &LogEntry) -> bool {
    let mut backoff = APPEND_BACKOFF;
    for attempt in 1..=APPEND_ATTEMPTS {
        match log.append(entry) {
            Ok(()) => return true,
            Err(e) if attempt < APPEND_ATTEMPTS => {
                warn!(
                    version = %entry.version,
                    attempt,
                    error = %e,
                    "log append failed, retrying"
                );
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(e) => {
                error!(version = %entry.version, error = %e, "log append failed permanently");
            }
        }
    }
    false
}

/// Repeated persistence failure takes this node down, gracefully: mark
/// the exit flag so peers treat it as a departure rather than waiting
/// on its frontiers.
fn fatal_persistence_failure(shared: &EngineShared, subgroup: SubgroupId, version: Version) {
    error!(%subgroup, %version, "persistence is unrecoverable; leaving the group");
    shared.shutdown.store(true, Ordering::Release);
    shared.sst.write_local(|row| row.rip = true);
    let _ = shared.sst.push_row_except_slots();
}

/// Publishes `persisted_num`, `signed_num`, and the signature bytes for
/// one freshly durable version.
fn publish_durability(
    shared: &EngineShared,
    subgroup: SubgroupId,
    version: Version,
    digest: &[u8],
    signature: Option<Vec<u8>>,
) {
    let column = shared.column(subgroup);
    let signature_size = shared.sst.schema().signature_size;
    shared.sst.write_local(|row| {
        row.persisted_num[column] = version;
        if let Some(sig) = &signature {
            row.signed_num[column] = version;
            let start = column * signature_size;
            row.signatures[start..start + sig.len()].copy_from_slice(sig);
        }
    });
    if let Err(e) = shared.sst.push_row_except_slots() {
        warn!(%subgroup, error = %e, "durability publish failed");
    }
    if signature.is_some() {
        shared
            .digests
            .lock()
            .expect("digest cache poisoned")
            .insert((subgroup, version.as_i64()), digest.to_vec());
    }
    if let Some(cb) = &shared.callbacks.user.local_persistence {
        cb(subgroup, version);
    }
}

fn save_restart_meta(shared: &EngineShared, dir: &std::path::Path) {
    let meta = RestartMeta {
        last_vid: Some(shared.vid),
        last_members: shared.sst.members().iter().map(|m| m.as_u32()).collect(),
        verified: shared
            .min_verified
            .iter()
            .map(|(sg, v)| (*sg, Version::new(v.load(Ordering::Acquire))))
            .collect(),
    };
    if let Err(e) = meta.save(dir) {
        warn!(error = %e, "restart metadata save failed");
    }
}

// ============================================================================
// Frontier predicates
// ============================================================================

impl EngineShared {
    /// Advances the global persistence frontier: the minimum
    /// `persisted_num` over live shard rows.
    fn update_min_persisted(&self, subgroup: SubgroupId) {
        let column = self.column(subgroup);
        let live = self.live_shard_rows(subgroup);
        if live.is_empty() {
            return;
        }
        let min = live
            .iter()
            .map(|r| self.sst.read(*r).persisted_num[column])
            .min()
            .expect("nonempty live set");
        let frontier = &self.min_persisted[&subgroup];
        if min.as_i64() > frontier.load(Ordering::Acquire) {
            frontier.store(min.as_i64(), Ordering::Release);
            let (_lock, cv) = &self.frontier_sync[&subgroup];
            cv.notify_all();
            self.callbacks.notify_global_persistence(subgroup, min);

            // Digests below the global frontier can never be needed for
            // verification again.
            let mut digests = self.digests.lock().expect("digest cache poisoned");
            let keep = digests.split_off(&(subgroup, min.as_i64()));
            digests.retain(|(sg, _), _| *sg != subgroup);
            digests.extend(keep);
        }
    }

    /// Verifies peers' signatures over their published `signed_num`
    /// versions against our own log digests, then advances our
    /// `verified_num` to the minimum verified version across the shard.
    fn update_verification(&self, subgroup: SubgroupId) {
        if self.signer.is_none() {
            return;
        }
        let s = &self.settings[&subgroup];
        let column = self.column(subgroup);
        let signature_size = self.sst.schema().signature_size;
        let rows = &self.shard_rows[&subgroup];

        let mut verified = self.peer_verified.lock().expect("verified map poisoned");
        let per_peer = verified.get_mut(&subgroup).expect("initialized per subgroup");

        for (shard_rank, row_index) in rows.iter().enumerate() {
            if self.sst.is_frozen(*row_index) {
                continue;
            }
            if shard_rank as u32 == s.shard_rank {
                per_peer[shard_rank] = self.sst.read_local().signed_num[column];
                continue;
            }
            let peer_node = s.members[shard_rank];
            let Some(key) = self.peer_keys.get(&peer_node) else {
                continue;
            };
            let (peer_signed, signature) = {
                let row = self.sst.read(*row_index);
                let start = column * signature_size;
                (
                    row.signed_num[column],
                    row.signatures[start..start + signature_size].to_vec(),
                )
            };
            if peer_signed <= per_peer[shard_rank] || !peer_signed.is_valid() {
                continue;
            }
            let digest = {
                let digests = self.digests.lock().expect("digest cache poisoned");
                digests.get(&(subgroup, peer_signed.as_i64())).cloned()
            };
            // We can only check versions we have persisted ourselves;
            // later passes catch up once our own log reaches it.
            let Some(digest) = digest else { continue };
            match key.verify(&digest, &signature) {
                Ok(()) => {
                    per_peer[shard_rank] = peer_signed;
                }
                Err(e) => {
                    warn!(
                        %subgroup,
                        peer = %peer_node,
                        version = %peer_signed,
                        error = %e,
                        "peer signature failed verification"
                    );
                }
            }
        }

        let candidate = rows
            .iter()
            .enumerate()
            .filter(|(_, row_index)| !self.sst.is_frozen(**row_index))
            .map(|(shard_rank, _)| per_peer[shard_rank])
            .min()
            .unwrap_or(Version::INVALID);
        drop(verified);

        let current = self.sst.read_local().verified_num[column];
        if candidate > current {
            self.sst.write_local(|row| row.verified_num[column] = candidate);
            if let Err(e) = self.sst.push_row_except_slots() {
                warn!(%subgroup, error = %e, "verification publish failed");
            }
        }
    }

    /// Advances the global verification frontier: minimum
    /// `verified_num` over live shard rows.
    fn update_min_verified(&self, subgroup: SubgroupId) {
        if self.signer.is_none() {
            return;
        }
        let column = self.column(subgroup);
        let live = self.live_shard_rows(subgroup);
        if live.is_empty() {
            return;
        }
        let min = live
            .iter()
            .map(|r| self.sst.read(*r).verified_num[column])
            .min()
            .expect("nonempty live set");
        let frontier = &self.min_verified[&subgroup];
        if min.as_i64() > frontier.load(Ordering::Acquire) {
            frontier.store(min.as_i64(), Ordering::Release);
            self.callbacks.notify_global_verified(subgroup, min);
            info!(%subgroup, frontier = %min, "verified frontier advanced");
        }
    }
}

pub(super) fn register_predicates(
    shared: &Arc<EngineShared>,
    handles: &mut Vec<PredicateHandle>,
) {
    let subgroups: Vec<SubgroupId> = shared.settings.keys().copied().collect();
    for subgroup in subgroups {
        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        handles.push(shared.sst.register_predicate(
            "min_persisted",
            |_| true,
            move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.update_min_persisted(subgroup);
                }
            },
            PredicateKind::Recurrent,
        ));

        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        handles.push(shared.sst.register_predicate(
            "verification",
            |_| true,
            move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.update_verification(subgroup);
                    shared.update_min_verified(subgroup);
                }
            },
            PredicateKind::Recurrent,
        ));
    }
}
