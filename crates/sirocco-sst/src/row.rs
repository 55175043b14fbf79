//! Row schema of the shared state table.
//!
//! The view manager and the multicast engine share one table, so a row
//! carries both families of columns: delivery frontiers and receipt
//! counters for the engine, membership-change bookkeeping for the view
//! manager, and the small-message slot region.
//!
//! Column widths are fixed at table construction from an [`SstSchema`];
//! rows of one table are structurally identical so a serialized row can
//! be applied in place at every peer.

use serde::{Deserialize, Serialize};
use sirocco_types::{ChangeProposal, SequenceNumber, Version, ViewId};

/// Column dimensions for one table, fixed at view install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstSchema {
    /// Rows in the table = members in the view.
    pub num_members: usize,
    /// Length of the per-subgroup column vectors.
    pub num_subgroups: usize,
    /// Bytes of one version signature (zero disables signed columns).
    pub signature_size: usize,
    /// Total sender slots across all subgroups this node belongs to
    /// (the `num_received` / `global_min` vector length).
    pub num_received_size: usize,
    /// Total bytes of the small-message slot region.
    pub slots_size: usize,
    /// Number of small-message index fields.
    pub index_size: usize,
}

impl SstSchema {
    /// Capacity of the `changes` vector. The extra headroom allows a
    /// burst of joins while the group is still small.
    pub fn max_changes(&self) -> usize {
        100 + self.num_members
    }

    /// Builds a zero-initialized row of this schema.
    ///
    /// `now_ns` seeds the stability frontier columns so a freshly
    /// installed member is not instantly suspected.
    pub fn new_row(&self, now_ns: u64) -> SstRow {
        SstRow {
            seq_num: vec![SequenceNumber::NONE; self.num_subgroups],
            delivered_num: vec![SequenceNumber::NONE; self.num_subgroups],
            persisted_num: vec![Version::INVALID; self.num_subgroups],
            signed_num: vec![Version::INVALID; self.num_subgroups],
            verified_num: vec![Version::INVALID; self.num_subgroups],
            signatures: vec![0; self.num_subgroups * self.signature_size],
            local_stability_frontier: vec![now_ns; self.num_subgroups],
            vid: ViewId::ZERO,
            suspected: vec![false; self.num_members],
            changes: Vec::with_capacity(self.max_changes()),
            joiner_ips: Vec::new(),
            joiner_gms_ports: Vec::new(),
            joiner_state_transfer_ports: Vec::new(),
            joiner_sst_ports: Vec::new(),
            joiner_rdmc_ports: Vec::new(),
            joiner_external_ports: Vec::new(),
            num_changes: 0,
            num_committed: 0,
            num_acked: 0,
            num_installed: 0,
            wedged: false,
            rip: false,
            num_received: vec![-1; self.num_received_size],
            global_min: vec![0; self.num_received_size],
            global_min_ready: vec![false; self.num_subgroups],
            slots: vec![0; self.slots_size],
            num_received_sst: vec![-1; self.num_received_size],
            index: vec![-1; self.index_size],
        }
    }
}

/// One member's row.
///
/// Per-subgroup vectors are indexed by subgroup id; `num_received` and
/// `global_min` are segmented per subgroup at that subgroup's
/// `num_received_offset` with one entry per shard sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SstRow {
    // === Multicast engine: delivery tracking ===
    /// Highest global sequence received in-order per subgroup. Updating
    /// `seq_num[i]` asserts receipt of every message at or below it in
    /// the round-robin order.
    pub seq_num: Vec<SequenceNumber>,
    /// Highest sequence delivered per subgroup. Delivery waits for
    /// stability, so `delivered_num[i] <= seq_num[i]`.
    pub delivered_num: Vec<SequenceNumber>,
    /// Highest version durably persisted per subgroup.
    pub persisted_num: Vec<Version>,
    /// Highest version locally signed per subgroup.
    pub signed_num: Vec<Version>,
    /// Highest version whose signatures from every shard peer have been
    /// verified locally, per subgroup.
    pub verified_num: Vec<Version>,
    /// Signature over the entry at `signed_num`, one signature-width
    /// span per subgroup. All zero for subgroups this node is not in.
    pub signatures: Vec<u8>,
    /// Wall-clock (ns) of the latest locally-stable message per
    /// subgroup; doubles as the heartbeat the failure detector watches.
    pub local_stability_frontier: Vec<u64>,

    // === View manager ===
    /// View id this row belongs to.
    pub vid: ViewId,
    /// Per-member suspicion flags, indexed by rank.
    pub suspected: Vec<bool>,
    /// Proposed-but-uninstalled membership changes. The number of live
    /// entries is `num_changes - num_installed`.
    pub changes: Vec<ChangeProposal>,
    /// For join proposals: the joiner's IPv4 address in network byte
    /// order, parallel to `changes`.
    pub joiner_ips: Vec<u32>,
    pub joiner_gms_ports: Vec<u16>,
    pub joiner_state_transfer_ports: Vec<u16>,
    pub joiner_sst_ports: Vec<u16>,
    pub joiner_rdmc_ports: Vec<u16>,
    pub joiner_external_ports: Vec<u16>,
    /// Total changes proposed; monotone.
    pub num_changes: i32,
    /// Changes that reached the commit point.
    pub num_committed: i32,
    /// Changes this member has acknowledged seeing.
    pub num_acked: i32,
    /// Changes installed into the current view; lower bound on
    /// `num_committed`.
    pub num_installed: i32,
    /// Set once this member's engine has wedged.
    pub wedged: bool,
    /// Graceful-exit flag.
    pub rip: bool,

    // === Receipt accounting ===
    /// Messages received per shard sender, segmented per subgroup. The
    /// value is the highest per-sender index received (so -1 = none).
    pub num_received: Vec<i32>,
    /// Per-sender trim frontier agreed during a view change, same
    /// segmentation as `num_received`.
    pub global_min: Vec<i32>,
    /// Whether each subgroup's shard leader has published `global_min`.
    pub global_min_ready: Vec<bool>,

    // === Small-message multicast ===
    /// Slot region: per subgroup, `window_size` slots of
    /// `max_smc_payload + header` bytes each.
    pub slots: Vec<u8>,
    /// Small-message receipt counters, same segmentation as
    /// `num_received`.
    pub num_received_sst: Vec<i32>,
    /// Small-message send counters, one per subgroup sender slot.
    pub index: Vec<i32>,
}

impl SstRow {
    /// Copies `other` into `self`, optionally preserving the local slot
    /// region (for pushes that elided it).
    pub fn merge_from(&mut self, mut other: SstRow, include_slots: bool) {
        if !include_slots {
            std::mem::swap(&mut other.slots, &mut self.slots);
        }
        *self = other;
    }

    /// Live (proposed but not installed) change proposals.
    pub fn pending_changes(&self) -> &[ChangeProposal] {
        &self.changes
    }
}

impl std::fmt::Display for SstRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vid={} chg={}/{}/{}/{} wedged={} rip={} seq={:?} del={:?} pers={:?}",
            self.vid,
            self.num_changes,
            self.num_acked,
            self.num_committed,
            self.num_installed,
            self.wedged,
            self.rip,
            self.seq_num.iter().map(|s| s.as_i64()).collect::<Vec<_>>(),
            self.delivered_num.iter().map(|s| s.as_i64()).collect::<Vec<_>>(),
            self.persisted_num.iter().map(|v| v.as_i64()).collect::<Vec<_>>(),
        )
    }
}
