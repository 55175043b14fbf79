//! The multicast engine.
//!
//! Within one installed view, delivers a totally ordered, reliable,
//! at-most-once multicast stream per shard. The engine composes the
//! bulk multicast (large payloads, block dissemination) and the
//! small-message path (payloads written into state-table slots) into a
//! single per-sender index space; receipt counters in the state table
//! drive stability, stability drives delivery, delivery drives
//! persistence and (optionally) signature verification, each frontier
//! published back into the table for the others to observe.
//!
//! One message's life: `Reserved` (index assigned in `send`) →
//! `InFlight` (blocks or slot pushed) → `Received` (buffered at every
//! receiver, receipt counters advanced) → `Stable` (received by all
//! shard members) → `Delivered` (callback invoked in round-robin
//! order) → `Persisted` → `Verified` → `Released` (buffers dropped,
//! window slot freed).

mod delivery;
mod persistence;

pub(crate) use delivery::ReceiptTracker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use sirocco_crypto::{SigningIdentity, VerifyingIdentity};
use sirocco_rbm::{BlockTransport, RbmGroup};
use sirocco_sst::{PredicateHandle, Sst};
use sirocco_types::{MessageHeader, NodeId, SubgroupId, Version, View, ViewId, HEADER_SIZE};
use tracing::{debug, error, info, warn};

use crate::callbacks::EngineCallbacks;
use crate::settings::{build_settings, subgroup_column, SubgroupSettings};
use crate::GroupError;

/// Wall clock in nanoseconds; message timestamps and heartbeats use it.
pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Configuration and preserved state
// ============================================================================

/// Engine construction parameters, distilled from the node
/// configuration by the group assembly.
#[derive(Clone)]
pub struct EngineConfig {
    pub vid: ViewId,
    /// How long `send` blocks on a full window before giving up.
    pub sender_timeout: Duration,
    /// Heartbeat publication interval.
    pub heartbeat: Duration,
    /// Base for dissemination group numbering in this view.
    pub rdmc_group_num_offset: u64,
    pub persist_dir: PathBuf,
    pub persist_reset: bool,
    pub max_log_entry: u64,
    pub max_data_size: u64,
    /// Signing identity for persisted versions; `None` disables the
    /// signature and verification frontiers.
    pub signer: Option<Arc<SigningIdentity>>,
    /// Peers' public keys for verifying their version signatures.
    pub peer_keys: BTreeMap<NodeId, VerifyingIdentity>,
}

/// Counters that survive a view change: the new view's engine resumes
/// version numbering where the old view stopped, and remembers the
/// delivered frontier so persistence waits keep answering correctly.
#[derive(Debug, Clone, Default)]
pub struct PreservedState {
    pub next_version: BTreeMap<SubgroupId, Version>,
    pub delivered_version: BTreeMap<SubgroupId, Version>,
}

// ============================================================================
// Message state
// ============================================================================

/// One buffered message (or one reserved slot of a null message),
/// keyed by global sequence number until delivery releases it.
pub(crate) struct PendingMessage {
    pub header: MessageHeader,
    pub sender_shard_rank: u32,
    /// Full buffer, header included. Empty for null slots.
    pub bytes: Bytes,
    /// True on the first sequence slot of a message; window accounting
    /// counts primaries only.
    pub primary: bool,
}

pub(crate) struct SubgroupState {
    /// Next per-sender index this node will assign when sending.
    pub future_index: i32,
    /// Count of SMM messages this node has written to its slot ring.
    pub smc_sent: i32,
    /// Our own reserved-but-undelivered messages (window occupancy).
    pub in_flight: u32,
    /// Buffered messages by global sequence number.
    pub buffered: BTreeMap<i64, PendingMessage>,
    /// Receipt trackers per sender rank (in-order frontier tracking).
    pub receipts: Vec<ReceiptTracker>,
    /// SMM messages consumed so far, per sender rank.
    pub smc_seen: Vec<i32>,
    /// Set once the view-change drain has run for this subgroup.
    pub trimmed: bool,
}

pub(crate) struct MsgState {
    pub subgroups: BTreeMap<SubgroupId, SubgroupState>,
}

pub(crate) enum SendCommand {
    Bulk { subgroup: SubgroupId, bytes: Bytes },
    Shutdown,
}

pub(crate) enum PersistCommand {
    Version {
        subgroup: SubgroupId,
        version: Version,
        timestamp: u64,
        payload: Bytes,
    },
    Shutdown,
}

// ============================================================================
// Shared engine core
// ============================================================================

pub(crate) struct EngineShared {
    pub vid: ViewId,
    pub sst: Arc<Sst>,
    pub settings: BTreeMap<SubgroupId, SubgroupSettings>,
    /// Subgroup id → column index in the per-subgroup row vectors.
    pub columns: BTreeMap<SubgroupId, usize>,
    /// Row indices (view ranks) of each shard's members, per subgroup.
    pub shard_rows: BTreeMap<SubgroupId, Vec<usize>>,
    pub state: Mutex<MsgState>,
    pub sender_cv: Condvar,
    pub sender_timeout: Duration,
    pub wedged: AtomicBool,
    pub shutdown: AtomicBool,
    pub callbacks: EngineCallbacks,
    pub next_version: BTreeMap<SubgroupId, AtomicI64>,
    pub delivered_version: BTreeMap<SubgroupId, AtomicI64>,
    pub min_persisted: BTreeMap<SubgroupId, AtomicI64>,
    pub min_verified: BTreeMap<SubgroupId, AtomicI64>,
    /// Condvar pairs for persistence-frontier waiters.
    pub frontier_sync: BTreeMap<SubgroupId, (Mutex<()>, Condvar)>,
    /// Dissemination groups where this node is the sender.
    pub send_groups: BTreeMap<SubgroupId, Arc<RbmGroup>>,
    /// Every group endpoint of this engine (kept alive for receiving).
    pub all_groups: Vec<Arc<RbmGroup>>,
    pub send_tx: Sender<SendCommand>,
    pub persist_tx: Sender<PersistCommand>,
    /// Signing digests of recently persisted entries, for verifying
    /// peers' signatures over the same versions.
    pub digests: Mutex<BTreeMap<(SubgroupId, i64), Vec<u8>>>,
    pub peer_keys: BTreeMap<NodeId, VerifyingIdentity>,
    /// Per subgroup: highest version verified from each shard member.
    pub peer_verified: Mutex<BTreeMap<SubgroupId, Vec<Version>>>,
    pub signer: Option<Arc<SigningIdentity>>,
}

impl EngineShared {
    pub(crate) fn column(&self, subgroup: SubgroupId) -> usize {
        self.columns[&subgroup]
    }

    /// Live (unfrozen) row indices of a shard, in shard order.
    pub(crate) fn live_shard_rows(&self, subgroup: SubgroupId) -> Vec<usize> {
        self.shard_rows[&subgroup]
            .iter()
            .copied()
            .filter(|r| !self.sst.is_frozen(*r))
            .collect()
    }
}

/// Deterministic dissemination-group numbering: every member derives
/// the same id for the same (subgroup, shard, sender).
fn rbm_group_id(offset: u64, column: usize, shard_num: u32, sender_rank: u32) -> u64 {
    offset + ((column as u64 * 64 + shard_num as u64) * 64 + sender_rank as u64)
}

// ============================================================================
// The engine
// ============================================================================

/// See the module documentation.
pub struct MulticastEngine {
    shared: Arc<EngineShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pred_handles: Mutex<Vec<PredicateHandle>>,
}

impl MulticastEngine {
    /// Builds the engine for one view.
    ///
    /// `preserved` carries version counters across a view change; pass
    /// the default for a fresh start.
    pub fn new(
        view: &View,
        sst: Arc<Sst>,
        transport: Arc<dyn BlockTransport>,
        callbacks: EngineCallbacks,
        config: EngineConfig,
        preserved: PreservedState,
    ) -> Result<Arc<Self>, GroupError> {
        let settings = build_settings(view);
        let me = view.members[view.my_rank.as_usize()];

        let mut columns = BTreeMap::new();
        let mut shard_rows = BTreeMap::new();
        for subgroup in settings.keys() {
            let column = subgroup_column(view, *subgroup)
                .ok_or(GroupError::InvalidSubgroup { subgroup: *subgroup })?;
            columns.insert(*subgroup, column);
            let shard = &settings[subgroup];
            let rows: Vec<usize> = shard
                .members
                .iter()
                .filter_map(|m| view.rank_of(*m).map(|r| r.as_usize()))
                .collect();
            shard_rows.insert(*subgroup, rows);
        }

        // Per-subgroup state and counters.
        let mut subgroup_states = BTreeMap::new();
        let mut next_version = BTreeMap::new();
        let mut delivered_version = BTreeMap::new();
        let mut min_persisted = BTreeMap::new();
        let mut min_verified = BTreeMap::new();
        let mut frontier_sync = BTreeMap::new();
        let mut peer_verified = BTreeMap::new();
        for (subgroup, s) in &settings {
            let num_senders = s.num_senders() as usize;
            subgroup_states.insert(
                *subgroup,
                SubgroupState {
                    future_index: 0,
                    smc_sent: 0,
                    in_flight: 0,
                    buffered: BTreeMap::new(),
                    receipts: (0..num_senders).map(|_| ReceiptTracker::new()).collect(),
                    smc_seen: vec![0; num_senders],
                    trimmed: false,
                },
            );
            let resume = preserved
                .next_version
                .get(subgroup)
                .copied()
                .unwrap_or(Version::new(0));
            next_version.insert(*subgroup, AtomicI64::new(resume.as_i64()));
            let delivered = preserved
                .delivered_version
                .get(subgroup)
                .copied()
                .unwrap_or(Version::INVALID);
            delivered_version.insert(*subgroup, AtomicI64::new(delivered.as_i64()));
            min_persisted.insert(*subgroup, AtomicI64::new(Version::INVALID.as_i64()));
            min_verified.insert(*subgroup, AtomicI64::new(Version::INVALID.as_i64()));
            frontier_sync.insert(*subgroup, (Mutex::new(()), Condvar::new()));
            peer_verified.insert(
                *subgroup,
                vec![Version::INVALID; s.num_shard_members() as usize],
            );
        }

        // Dissemination groups: one per (shard, sender), members rotated
        // sender-first so position 0 is always the sender.
        let holder: Arc<OnceLock<Weak<EngineShared>>> = Arc::new(OnceLock::new());
        let mut send_groups = BTreeMap::new();
        let mut all_groups = Vec::new();
        for (subgroup, s) in &settings {
            let column = columns[subgroup];
            for sender_rank in 0..s.num_senders() {
                let sender_shard_rank = s
                    .shard_rank_of_sender(sender_rank)
                    .ok_or(GroupError::InvalidSubgroup { subgroup: *subgroup })?;
                let mut members = s.members.clone();
                members.rotate_left(sender_shard_rank as usize);
                let group_id =
                    rbm_group_id(config.rdmc_group_num_offset, column, s.shard_num, sender_rank);
                let holder = holder.clone();
                let subgroup_id = *subgroup;
                let group = RbmGroup::new(
                    group_id,
                    members,
                    me,
                    s.profile.block_size as usize,
                    s.profile.send_algorithm,
                    transport.clone(),
                    Box::new(move |_sender, size, bytes| {
                        if let Some(shared) = holder.get().and_then(Weak::upgrade) {
                            shared.handle_bulk_message(
                                subgroup_id,
                                sender_rank,
                                sender_shard_rank,
                                size,
                                bytes,
                            );
                        }
                    }),
                )?;
                if sender_shard_rank == s.shard_rank {
                    send_groups.insert(*subgroup, group.clone());
                }
                all_groups.push(group);
            }
        }

        let (send_tx, send_rx) = unbounded();
        let (persist_tx, persist_rx) = unbounded();

        let shared = Arc::new(EngineShared {
            vid: config.vid,
            sst,
            settings,
            columns,
            shard_rows,
            state: Mutex::new(MsgState {
                subgroups: subgroup_states,
            }),
            sender_cv: Condvar::new(),
            sender_timeout: config.sender_timeout,
            wedged: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            callbacks,
            next_version,
            delivered_version,
            min_persisted,
            min_verified,
            frontier_sync,
            send_groups,
            all_groups,
            send_tx,
            persist_tx,
            digests: Mutex::new(BTreeMap::new()),
            peer_keys: config.peer_keys.clone(),
            peer_verified: Mutex::new(peer_verified),
            signer: config.signer.clone(),
        });
        let _ = holder.set(Arc::downgrade(&shared));

        let mut threads = Vec::new();
        threads.push(Self::spawn_sender_thread(shared.clone(), send_rx));
        threads.push(persistence::spawn_persistence_thread(
            shared.clone(),
            persist_rx,
            &config,
        )?);
        threads.push(Self::spawn_timeout_thread(shared.clone(), config.heartbeat));

        let mut handles = delivery::register_predicates(&shared);
        persistence::register_predicates(&shared, &mut handles);

        info!(vid = %config.vid, subgroups = shared.settings.len(), "multicast engine up");
        Ok(Arc::new(Self {
            shared,
            threads: Mutex::new(threads),
            pred_handles: Mutex::new(handles),
        }))
    }

    // ========================================================================
    // Public contract
    // ========================================================================

    /// Reserves a send slot in `subgroup`, hands `writer` a zeroed
    /// buffer of `payload_size` bytes (header excluded) to fill, and
    /// transmits.
    ///
    /// Returns `Ok(false)` (without invoking `writer`) when the
    /// payload exceeds the shard's limit, the engine is wedged, or the
    /// window stays full past the sender timeout.
    pub fn send(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        writer: impl FnOnce(&mut [u8]),
        cooked: bool,
    ) -> Result<bool, GroupError> {
        let shared = &self.shared;
        let s = shared
            .settings
            .get(&subgroup)
            .ok_or(GroupError::InvalidSubgroup { subgroup })?;
        if s.sender_rank.is_none() {
            warn!(%subgroup, "send from a non-sender member rejected");
            return Ok(false);
        }
        if payload_size as u64 > s.profile.max_payload_size {
            warn!(
                %subgroup,
                payload_size,
                max = s.profile.max_payload_size,
                "send rejected: payload exceeds shard limit"
            );
            return Ok(false);
        }
        if shared.wedged.load(Ordering::Acquire) {
            return Ok(false);
        }

        let use_smc = payload_size as u64 <= s.profile.max_smc_payload_size;
        let window = s.profile.window_size;
        let mut state = shared.state.lock().expect("engine state poisoned");

        // Window admission: wait for an own slot, bounded by the sender
        // timeout.
        let deadline = std::time::Instant::now() + shared.sender_timeout;
        loop {
            if shared.wedged.load(Ordering::Acquire) || shared.shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }
            let sub = state
                .subgroups
                .get(&subgroup)
                .expect("settings and state agree");
            if sub.in_flight < window {
                break;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                warn!(%subgroup, "send rejected: window full past sender timeout");
                return Ok(false);
            }
            let (next, _timeout) = shared
                .sender_cv
                .wait_timeout(state, deadline - now)
                .expect("engine state poisoned");
            state = next;
        }

        let sub = state
            .subgroups
            .get_mut(&subgroup)
            .expect("settings and state agree");
        let index = sub.future_index;
        sub.future_index += 1;
        sub.in_flight += 1;

        let header = MessageHeader::new(index, now_ns(), cooked);
        let mut buffer = BytesMut::zeroed(HEADER_SIZE + payload_size);
        header.encode_into(&mut buffer[..HEADER_SIZE]);
        writer(&mut buffer[HEADER_SIZE..]);
        let bytes = buffer.freeze();

        let sender_rank = s.sender_rank.expect("checked above");
        let smc_slot = if use_smc {
            let slot = (sub.smc_sent % s.profile.window_size as i32) as usize;
            sub.smc_sent += 1;
            Some(slot)
        } else {
            None
        };

        // Self-accounting: buffer our own copy and advance our receipt
        // counter so single-member shards make progress.
        let frontier =
            shared.account_receipt(&mut state, subgroup, sender_rank, s.shard_rank, header, bytes.clone());
        drop(state);

        let receipt_offset = s.num_received_offset + sender_rank as usize;
        match smc_slot {
            Some(slot) => {
                // Small-message path: write into our slot ring and bump
                // the index field; the row push carries the bytes.
                let slot_size = s.slot_size();
                let slot_start = s.slot_offset + slot * slot_size;
                let column = shared.column(subgroup);
                shared.sst.write_local(|row| {
                    row.slots[slot_start..slot_start + 4]
                        .copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                    row.slots[slot_start + 4..slot_start + 4 + bytes.len()]
                        .copy_from_slice(&bytes);
                    row.index[column] += 1;
                    if row.num_received[receipt_offset] < frontier {
                        row.num_received[receipt_offset] = frontier;
                    }
                });
                shared.sst.push_row()?;
            }
            None => {
                shared.sst.write_local(|row| {
                    if row.num_received[receipt_offset] < frontier {
                        row.num_received[receipt_offset] = frontier;
                    }
                });
                shared.sst.push_row_except_slots()?;
                let _ = shared.send_tx.send(SendCommand::Bulk { subgroup, bytes });
            }
        }
        Ok(true)
    }

    /// Emits a null message reserving `num_nulls` sequence slots with
    /// no payload, letting this sender's stream advance when it has
    /// nothing to say (the view-change drain uses this to bring a
    /// lagging sender up to the trim frontier).
    pub fn send_null(&self, subgroup: SubgroupId, num_nulls: u32) -> Result<bool, GroupError> {
        let shared = &self.shared;
        let s = shared
            .settings
            .get(&subgroup)
            .ok_or(GroupError::InvalidSubgroup { subgroup })?;
        let Some(sender_rank) = s.sender_rank else {
            return Ok(false);
        };
        if num_nulls == 0 || shared.shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }

        let mut state = shared.state.lock().expect("engine state poisoned");
        let sub = state
            .subgroups
            .get_mut(&subgroup)
            .expect("settings and state agree");
        let index = sub.future_index;
        sub.future_index += num_nulls as i32;
        sub.in_flight += 1;
        let slot = (sub.smc_sent % s.profile.window_size as i32) as usize;
        sub.smc_sent += 1;

        let header = MessageHeader::null(index, now_ns(), num_nulls);
        let bytes = Bytes::copy_from_slice(&header.encode());
        let frontier =
            shared.account_receipt(&mut state, subgroup, sender_rank, s.shard_rank, header, bytes.clone());
        drop(state);

        let receipt_offset = s.num_received_offset + sender_rank as usize;
        let slot_size = s.slot_size();
        let slot_start = s.slot_offset + slot * slot_size;
        let column = shared.column(subgroup);
        shared.sst.write_local(|row| {
            row.slots[slot_start..slot_start + 4]
                .copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            row.slots[slot_start + 4..slot_start + 4 + bytes.len()].copy_from_slice(&bytes);
            row.index[column] += 1;
            if row.num_received[receipt_offset] < frontier {
                row.num_received[receipt_offset] = frontier;
            }
        });
        shared.sst.push_row()?;
        Ok(true)
    }

    /// Force-delivers all buffered messages with per-sender indices at
    /// or below `max_indices`, in global order, discarding the rest.
    /// The view-change drain calls this once the trim frontier is
    /// agreed.
    pub fn deliver_messages_upto(&self, max_indices: &[i32], subgroup: SubgroupId) {
        delivery::deliver_upto(&self.shared, max_indices, subgroup);
    }

    /// Ceases sends and commits final receipts. Idempotent.
    pub fn wedge(&self) {
        let shared = &self.shared;
        if shared.wedged.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(vid = %shared.vid, "engine wedged");
        shared.sender_cv.notify_all();
        shared.sst.write_local(|row| row.wedged = true);
        if let Err(e) = shared.sst.push_row_except_slots() {
            warn!(error = %e, "failed to publish wedged flag");
        }
    }

    pub fn is_wedged(&self) -> bool {
        self.shared.wedged.load(Ordering::Acquire)
    }

    /// Minimum across shard peers of the latest in-order message
    /// timestamp they have reached, in nanoseconds.
    pub fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64 {
        let shared = &self.shared;
        let Some(column) = shared.columns.get(&subgroup).copied() else {
            return 0;
        };
        shared
            .live_shard_rows(subgroup)
            .iter()
            .map(|r| shared.sst.read(*r).local_stability_frontier[column])
            .min()
            .unwrap_or(0)
    }

    /// Latest version persisted by every shard member.
    pub fn get_global_persistence_frontier(&self, subgroup: SubgroupId) -> Version {
        self.shared
            .min_persisted
            .get(&subgroup)
            .map(|a| Version::new(a.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Blocks until the global persistence frontier reaches `version`.
    /// Returns `false` immediately when `version` is beyond the latest
    /// delivered version.
    pub fn wait_for_global_persistence_frontier(
        &self,
        subgroup: SubgroupId,
        version: Version,
    ) -> Result<bool, GroupError> {
        let shared = &self.shared;
        let delivered = shared
            .delivered_version
            .get(&subgroup)
            .ok_or(GroupError::InvalidSubgroup { subgroup })?;
        if version.as_i64() > delivered.load(Ordering::Acquire) {
            return Ok(false);
        }
        let frontier = &shared.min_persisted[&subgroup];
        let (lock, cv) = &shared.frontier_sync[&subgroup];
        let mut guard = lock.lock().expect("frontier lock poisoned");
        loop {
            if frontier.load(Ordering::Acquire) >= version.as_i64() {
                return Ok(true);
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return Err(GroupError::Shutdown);
            }
            let (next, _) = cv
                .wait_timeout(guard, Duration::from_millis(50))
                .expect("frontier lock poisoned");
            guard = next;
        }
    }

    /// Latest version whose signatures from every shard member have
    /// been verified locally.
    pub fn get_global_verified_frontier(&self, subgroup: SubgroupId) -> Version {
        self.shared
            .min_verified
            .get(&subgroup)
            .map(|a| Version::new(a.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Version counters to seed the next view's engine.
    pub fn preserved_state(&self) -> PreservedState {
        let next_version = self
            .shared
            .next_version
            .iter()
            .map(|(sg, v)| (*sg, Version::new(v.load(Ordering::Acquire))))
            .collect();
        let delivered_version = self
            .shared
            .delivered_version
            .iter()
            .map(|(sg, v)| (*sg, Version::new(v.load(Ordering::Acquire))))
            .collect();
        PreservedState {
            next_version,
            delivered_version,
        }
    }

    /// The engine's dissemination group endpoints, for transport
    /// binding.
    pub fn rbm_groups(&self) -> Vec<Arc<RbmGroup>> {
        self.shared.all_groups.clone()
    }

    /// Highest contiguous per-sender indices received, in sender-rank
    /// order. The view manager publishes these as its drain receipts.
    pub fn receipt_frontier(&self, subgroup: SubgroupId) -> Vec<i32> {
        let state = self.shared.state.lock().expect("engine state poisoned");
        state
            .subgroups
            .get(&subgroup)
            .map(|sub| sub.receipts.iter().map(|t| t.frontier()).collect())
            .unwrap_or_default()
    }

    /// Cooperative shutdown: stops the worker threads and removes the
    /// engine's predicates. The table itself stays up (the view manager
    /// owns it).
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.sender_cv.notify_all();
        let _ = shared.send_tx.send(SendCommand::Shutdown);
        let _ = shared.persist_tx.send(PersistCommand::Shutdown);
        for handle in self.pred_handles.lock().expect("handles poisoned").drain(..) {
            shared.sst.remove_predicate(handle);
        }
        for thread in self.threads.lock().expect("threads poisoned").drain(..) {
            let _ = thread.join();
        }
        debug!(vid = %shared.vid, "engine shut down");
    }

    // ========================================================================
    // Worker threads
    // ========================================================================

    fn spawn_sender_thread(
        shared: Arc<EngineShared>,
        rx: Receiver<SendCommand>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("engine-sender".to_string())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        SendCommand::Shutdown => break,
                        SendCommand::Bulk { subgroup, bytes } => {
                            if shared.wedged.load(Ordering::Acquire) {
                                // Reserved before the wedge; the drain
                                // will discard it everywhere.
                                continue;
                            }
                            let Some(group) = shared.send_groups.get(&subgroup) else {
                                continue;
                            };
                            if let Err(e) = group.send(bytes) {
                                warn!(%subgroup, error = %e, "bulk multicast send failed");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn sender thread")
    }

    fn spawn_timeout_thread(shared: Arc<EngineShared>, heartbeat: Duration) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("engine-timeout".to_string())
            .spawn(move || loop {
                std::thread::sleep(heartbeat);
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let now = now_ns();
                // Every column, not just our subgroups': these double
                // as the heartbeat the failure detector watches, and a
                // member of no shard must still look alive.
                shared.sst.write_local(|row| {
                    for frontier in row.local_stability_frontier.iter_mut() {
                        if *frontier < now {
                            *frontier = now;
                        }
                    }
                });
                if let Err(e) = shared.sst.push_row_except_slots() {
                    warn!(error = %e, "heartbeat push failed");
                }
            })
            .expect("failed to spawn timeout thread")
    }
}

impl Drop for MulticastEngine {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            error!("engine dropped without shutdown; stopping threads");
            self.shutdown();
        }
    }
}
