//! Per-subgroup engine settings and the shared row layout.
//!
//! The state table row is one flat structure shared by every member, so
//! all members must agree on where each subgroup's counters and slots
//! live. The layout walks subgroups in id order and reserves, per
//! subgroup, the *maximum* sender count and slot footprint over its
//! shards; each member then interprets its own subgroup's range
//! relative to the one shard of that subgroup it belongs to.

use std::collections::BTreeMap;

use sirocco_types::{DeliveryMode, NodeId, ShardProfile, SubView, SubgroupId, View, HEADER_SIZE};
use sirocco_sst::SstSchema;

/// Bytes reserved at the front of each small-message slot for the
/// message length.
pub const SLOT_LEN_PREFIX: usize = 4;

/// Engine-facing settings for one shard the local node belongs to.
#[derive(Debug, Clone)]
pub struct SubgroupSettings {
    pub subgroup: SubgroupId,
    pub shard_num: u32,
    /// Local node's rank within the shard.
    pub shard_rank: u32,
    /// Shard members in shard order.
    pub members: Vec<NodeId>,
    /// Parallel sender flags.
    pub senders: Vec<bool>,
    /// Local node's sender rank, when it may send.
    pub sender_rank: Option<u32>,
    /// Start of this subgroup's range in `num_received` /
    /// `global_min` / `num_received_sst`.
    pub num_received_offset: usize,
    /// Start of this subgroup's slot region, in bytes.
    pub slot_offset: usize,
    pub mode: DeliveryMode,
    pub profile: ShardProfile,
}

impl SubgroupSettings {
    pub fn num_shard_members(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn num_senders(&self) -> u32 {
        self.senders.iter().filter(|s| **s).count() as u32
    }

    /// Size in bytes of one small-message slot: a 4-byte length
    /// prefix, the header, and the payload capacity.
    pub fn slot_size(&self) -> usize {
        SLOT_LEN_PREFIX + self.profile.max_smc_payload_size as usize + HEADER_SIZE
    }

    /// Shard-rank of the sender with sender-rank `k`.
    pub fn shard_rank_of_sender(&self, sender_rank: u32) -> Option<u32> {
        let mut seen = 0;
        for (rank, is_sender) in self.senders.iter().enumerate() {
            if *is_sender {
                if seen == sender_rank {
                    return Some(rank as u32);
                }
                seen += 1;
            }
        }
        None
    }
}

fn max_senders(shards: &[SubView]) -> usize {
    shards
        .iter()
        .map(|s| s.num_senders() as usize)
        .max()
        .unwrap_or(0)
}

fn max_slot_bytes(shards: &[SubView]) -> usize {
    shards
        .iter()
        .map(|s| {
            (SLOT_LEN_PREFIX + s.profile.max_smc_payload_size as usize + HEADER_SIZE)
                * s.profile.window_size as usize
        })
        .max()
        .unwrap_or(0)
}

/// Computes the table schema every member of `view` agrees on.
pub fn build_schema(view: &View, signature_size: usize) -> SstSchema {
    let mut num_received_size = 0;
    let mut slots_size = 0;
    for shards in view.subgroup_shards.values() {
        num_received_size += max_senders(shards);
        slots_size += max_slot_bytes(shards);
    }
    let num_subgroups = view.subgroup_shards.len();
    SstSchema {
        num_members: view.num_members(),
        num_subgroups,
        signature_size,
        num_received_size,
        slots_size,
        index_size: num_subgroups,
    }
}

/// Builds the settings map for the shards the local node belongs to.
///
/// Offsets are accumulated over *all* subgroups in id order so that the
/// resulting positions agree across members regardless of which shards
/// each belongs to.
pub fn build_settings(view: &View) -> BTreeMap<SubgroupId, SubgroupSettings> {
    let me = view.members[view.my_rank.as_usize()];
    let mut settings = BTreeMap::new();
    let mut num_received_offset = 0;
    let mut slot_offset = 0;
    for (subgroup, shards) in &view.subgroup_shards {
        for (shard_num, shard) in shards.iter().enumerate() {
            let Some(shard_rank) = shard.rank_of(me) else {
                continue;
            };
            settings.insert(
                *subgroup,
                SubgroupSettings {
                    subgroup: *subgroup,
                    shard_num: shard_num as u32,
                    shard_rank,
                    members: shard.members.clone(),
                    senders: shard.is_sender.clone(),
                    sender_rank: shard.sender_rank_of(shard_rank),
                    num_received_offset,
                    slot_offset,
                    mode: shard.mode,
                    profile: shard.profile,
                },
            );
        }
        num_received_offset += max_senders(shards);
        slot_offset += max_slot_bytes(shards);
    }
    settings
}

/// Index of `subgroup` among the view's subgroups, used to address the
/// per-subgroup column vectors.
pub fn subgroup_column(view: &View, subgroup: SubgroupId) -> Option<usize> {
    view.subgroup_shards.keys().position(|sg| *sg == subgroup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sirocco_types::{MemberAddress, Rank, ViewId};

    fn test_view(me: u32) -> View {
        let members: Vec<NodeId> = (1..=4).map(NodeId::new).collect();
        let addresses = members
            .iter()
            .map(|n| MemberAddress::localhost(20_000 + n.as_u32() as u16 * 10))
            .collect();
        let mut view = View::new(ViewId::ZERO, members, addresses, NodeId::new(me));
        let profile = ShardProfile {
            max_smc_payload_size: 100,
            window_size: 2,
            ..ShardProfile::default()
        };
        view.subgroup_shards.insert(
            SubgroupId::new(0),
            vec![SubView::new(
                DeliveryMode::Ordered,
                vec![NodeId::new(1), NodeId::new(2)],
                profile,
            )],
        );
        view.subgroup_shards.insert(
            SubgroupId::new(1),
            vec![
                SubView::new(DeliveryMode::Ordered, vec![NodeId::new(1)], profile),
                SubView::new(
                    DeliveryMode::Ordered,
                    vec![NodeId::new(2), NodeId::new(3), NodeId::new(4)],
                    profile,
                )
                .with_senders(&[NodeId::new(4)]),
            ],
        );
        view
    }

    #[test]
    fn offsets_agree_across_members() {
        // Subgroup 0 reserves 2 sender slots; subgroup 1 reserves
        // max(1, 1) = 1. Every member computes the same offsets.
        for me in 1..=4 {
            let view = test_view(me);
            let settings = build_settings(&view);
            if let Some(s) = settings.get(&SubgroupId::new(1)) {
                assert_eq!(s.num_received_offset, 2, "member {me}");
            }
            if let Some(s) = settings.get(&SubgroupId::new(0)) {
                assert_eq!(s.num_received_offset, 0, "member {me}");
            }
        }
    }

    #[test]
    fn schema_counts_all_subgroups() {
        let view = test_view(1);
        let schema = build_schema(&view, 64);
        assert_eq!(schema.num_subgroups, 2);
        assert_eq!(schema.num_received_size, 3);
        let slot = SLOT_LEN_PREFIX + 100 + HEADER_SIZE;
        assert_eq!(schema.slots_size, 2 * (2 * slot));
        assert_eq!(schema.index_size, 2);
    }

    #[test]
    fn membership_filters_settings() {
        let view = test_view(3);
        let settings = build_settings(&view);
        // Node 3 is only in subgroup 1's second shard.
        assert_eq!(settings.len(), 1);
        let s = &settings[&SubgroupId::new(1)];
        assert_eq!(s.shard_num, 1);
        assert_eq!(s.shard_rank, 1);
        assert_eq!(s.sender_rank, None);
        assert_eq!(s.num_senders(), 1);
        assert_eq!(s.shard_rank_of_sender(0), Some(2));
    }

    #[test]
    fn my_rank_is_consistent() {
        let view = test_view(2);
        assert_eq!(view.my_rank, Rank::new(1));
        let settings = build_settings(&view);
        assert_eq!(settings[&SubgroupId::new(0)].shard_rank, 1);
    }
}
