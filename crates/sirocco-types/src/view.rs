//! Views and shard sub-views.
//!
//! A [`View`] is one entry in the totally-ordered sequence of membership
//! epochs: the ordered roster of live members, which nodes joined or
//! departed relative to the previous view, and the assignment of members
//! to subgroup shards. The member order fixes each member's [`Rank`],
//! which is also its row index in the shared state table.
//!
//! A [`SubView`] describes one shard of one subgroup within a view: its
//! members, which of them may send, its delivery mode, and its multicast
//! profile.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{DeliveryMode, NodeId, Rank, ShardProfile, SubgroupId, ViewId};

// ============================================================================
// Member addresses
// ============================================================================

/// The network coordinates of one member: its IP plus the per-service
/// ports it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAddress {
    pub ip: Ipv4Addr,
    pub gms_port: u16,
    pub state_transfer_port: u16,
    pub sst_port: u16,
    pub rbm_port: u16,
    pub external_port: u16,
}

impl MemberAddress {
    pub fn localhost(gms_port: u16) -> Self {
        Self {
            ip: Ipv4Addr::LOCALHOST,
            gms_port,
            state_transfer_port: gms_port + 1,
            sst_port: gms_port + 2,
            rbm_port: gms_port + 3,
            external_port: gms_port + 4,
        }
    }
}

// ============================================================================
// SubView
// ============================================================================

/// One shard of one subgroup, as seen within a single view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubView {
    /// Delivery discipline for this shard.
    pub mode: DeliveryMode,
    /// Shard members, a subsequence of the view's member list.
    pub members: Vec<NodeId>,
    /// Parallel to `members`: true for members allowed to send.
    pub is_sender: Vec<bool>,
    /// Members of this shard that were not in the previous view's shard.
    pub joined: Vec<NodeId>,
    /// Members of the previous view's shard that are gone.
    pub departed: Vec<NodeId>,
    /// Multicast parameters resolved from the shard's profile.
    pub profile: ShardProfile,
}

impl SubView {
    pub fn new(mode: DeliveryMode, members: Vec<NodeId>, profile: ShardProfile) -> Self {
        let is_sender = vec![true; members.len()];
        Self {
            mode,
            members,
            is_sender,
            joined: Vec::new(),
            departed: Vec::new(),
            profile,
        }
    }

    /// Restricts the sender set to the given members.
    pub fn with_senders(mut self, senders: &[NodeId]) -> Self {
        self.is_sender = self
            .members
            .iter()
            .map(|m| senders.contains(m))
            .collect();
        self
    }

    /// This shard's rank of `node`, or `None` if it is not a member.
    pub fn rank_of(&self, node: NodeId) -> Option<u32> {
        self.members.iter().position(|m| *m == node).map(|i| i as u32)
    }

    /// The sender-rank of the member at `shard_rank`: its position among
    /// the shard's senders. `None` if that member may not send.
    pub fn sender_rank_of(&self, shard_rank: u32) -> Option<u32> {
        let idx = shard_rank as usize;
        if !self.is_sender.get(idx).copied().unwrap_or(false) {
            return None;
        }
        Some(
            self.is_sender[..idx]
                .iter()
                .filter(|s| **s)
                .count() as u32,
        )
    }

    /// Number of members allowed to send in this shard.
    pub fn num_senders(&self) -> u32 {
        self.is_sender.iter().filter(|s| **s).count() as u32
    }
}

// ============================================================================
// View
// ============================================================================

/// One membership epoch: the ordered roster plus shard assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Monotonic view id.
    pub vid: ViewId,
    /// Ordered list of members; index = rank = state-table row.
    pub members: Vec<NodeId>,
    /// Network coordinates, parallel to `members`.
    pub addresses: Vec<MemberAddress>,
    /// Parallel to `members`: true once a member has been declared failed
    /// within this view.
    pub failed: Vec<bool>,
    /// Members that joined relative to the previous view.
    pub joined: Vec<NodeId>,
    /// Members that departed relative to the previous view.
    pub departed: Vec<NodeId>,
    /// The local node's rank within `members`.
    pub my_rank: Rank,
    /// Shards per subgroup, indexed by subgroup id then shard number.
    pub subgroup_shards: BTreeMap<SubgroupId, Vec<SubView>>,
}

impl View {
    pub fn new(
        vid: ViewId,
        members: Vec<NodeId>,
        addresses: Vec<MemberAddress>,
        my_node: NodeId,
    ) -> Self {
        let my_rank = members
            .iter()
            .position(|m| *m == my_node)
            .map(|i| Rank::new(i as u32))
            .unwrap_or_default();
        let failed = vec![false; members.len()];
        Self {
            vid,
            members,
            addresses,
            failed,
            joined: Vec::new(),
            departed: Vec::new(),
            my_rank,
            subgroup_shards: BTreeMap::new(),
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn num_failed(&self) -> usize {
        self.failed.iter().filter(|f| **f).count()
    }

    /// The rank of `node` in this view.
    pub fn rank_of(&self, node: NodeId) -> Option<Rank> {
        self.members
            .iter()
            .position(|m| *m == node)
            .map(|i| Rank::new(i as u32))
    }

    pub fn member_at(&self, rank: Rank) -> Option<NodeId> {
        self.members.get(rank.as_usize()).copied()
    }

    /// The current leader: the lowest-ranked member not declared failed.
    pub fn leader_rank(&self) -> Option<Rank> {
        self.failed
            .iter()
            .position(|f| !*f)
            .map(|i| Rank::new(i as u32))
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader_rank().and_then(|r| self.member_at(r))
    }

    pub fn i_am_leader(&self) -> bool {
        self.leader_rank() == Some(self.my_rank)
    }

    /// Partitioning safety: a successor view is adequate only when it
    /// retains a majority of this view's membership.
    pub fn is_adequate_successor(&self, surviving: usize) -> bool {
        surviving * 2 > self.num_members()
    }

    /// Iterates the shards the local node belongs to, with the local
    /// shard number within each subgroup.
    pub fn my_shards(&self) -> impl Iterator<Item = (SubgroupId, u32, &SubView)> {
        let me = self.members[self.my_rank.as_usize()];
        self.subgroup_shards.iter().flat_map(move |(sg, shards)| {
            shards
                .iter()
                .enumerate()
                .filter(move |(_, shard)| shard.rank_of(me).is_some())
                .map(move |(num, shard)| (*sg, num as u32, shard))
        })
    }

    /// Ranks (row indices) of the members of one shard, in shard order.
    pub fn shard_row_indices(&self, shard: &SubView) -> Vec<usize> {
        shard
            .members
            .iter()
            .filter_map(|m| self.rank_of(*m).map(Rank::as_usize))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[u32]) -> (Vec<NodeId>, Vec<MemberAddress>) {
        let nodes: Vec<NodeId> = ids.iter().copied().map(NodeId::new).collect();
        let addrs = ids
            .iter()
            .map(|id| MemberAddress::localhost(20_000 + (*id as u16) * 10))
            .collect();
        (nodes, addrs)
    }

    #[test]
    fn ranks_follow_member_order() {
        let (nodes, addrs) = members(&[5, 1, 9]);
        let view = View::new(ViewId::new(0), nodes, addrs, NodeId::new(9));
        assert_eq!(view.rank_of(NodeId::new(5)), Some(Rank::new(0)));
        assert_eq!(view.rank_of(NodeId::new(9)), Some(Rank::new(2)));
        assert_eq!(view.my_rank, Rank::new(2));
        assert_eq!(view.rank_of(NodeId::new(2)), None);
    }

    #[test]
    fn leader_skips_failed_members() {
        let (nodes, addrs) = members(&[1, 2, 3]);
        let mut view = View::new(ViewId::new(3), nodes, addrs, NodeId::new(2));
        assert_eq!(view.leader(), Some(NodeId::new(1)));
        view.failed[0] = true;
        assert_eq!(view.leader(), Some(NodeId::new(2)));
    }

    #[test]
    fn adequacy_requires_majority() {
        let (nodes, addrs) = members(&[1, 2, 3, 4]);
        let view = View::new(ViewId::new(0), nodes, addrs, NodeId::new(1));
        assert!(view.is_adequate_successor(3));
        assert!(!view.is_adequate_successor(2));
    }

    #[test]
    fn sender_ranks_count_only_senders() {
        let shard = SubView::new(
            DeliveryMode::Ordered,
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3), NodeId::new(4)],
            ShardProfile::default(),
        )
        .with_senders(&[NodeId::new(2), NodeId::new(4)]);

        assert_eq!(shard.num_senders(), 2);
        assert_eq!(shard.sender_rank_of(0), None);
        assert_eq!(shard.sender_rank_of(1), Some(0));
        assert_eq!(shard.sender_rank_of(3), Some(1));
    }

    #[test]
    fn my_shards_filters_by_membership() {
        let (nodes, addrs) = members(&[1, 2, 3]);
        let mut view = View::new(ViewId::new(0), nodes, addrs, NodeId::new(3));
        view.subgroup_shards.insert(
            SubgroupId::new(0),
            vec![SubView::new(
                DeliveryMode::Ordered,
                vec![NodeId::new(1), NodeId::new(2)],
                ShardProfile::default(),
            )],
        );
        view.subgroup_shards.insert(
            SubgroupId::new(1),
            vec![SubView::new(
                DeliveryMode::Ordered,
                vec![NodeId::new(2), NodeId::new(3)],
                ShardProfile::default(),
            )],
        );

        let mine: Vec<_> = view.my_shards().map(|(sg, num, _)| (sg, num)).collect();
        assert_eq!(mine, vec![(SubgroupId::new(1), 0)]);
    }
}
