//! # sirocco-types: Core types for Sirocco
//!
//! This crate contains the shared vocabulary of the group communication
//! engine:
//! - Member identities ([`NodeId`], [`Rank`])
//! - Group structure ([`SubgroupId`], [`ShardNum`], [`ViewId`])
//! - Message identities ([`MessageIndex`], [`SequenceNumber`], [`Version`])
//! - The fixed multicast message header ([`MessageHeader`])
//! - Membership change proposals ([`ChangeProposal`])
//! - Shard delivery parameters ([`ShardProfile`], [`SendAlgorithm`],
//!   [`DeliveryMode`])
//! - Views and shard sub-views ([`View`], [`SubView`])
//!
//! Everything here is `Copy` or cheaply cloneable and carries serde
//! derives, since most of these values cross the wire inside shared
//! state table rows or control frames.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod header;
mod view;

pub use header::{HeaderError, MessageHeader, HEADER_SIZE};
pub use view::{MemberAddress, SubView, View};

// ============================================================================
// Member identities
// ============================================================================

/// Stable identifier of a process in the group.
///
/// Node ids are assigned by configuration and never change: a node that
/// crashes and restarts re-joins under the same id. Ids must be below the
/// configured `max_node_id`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// A member's position in the ordered member list of an installed view.
///
/// The rank doubles as the member's row index in the shared state table,
/// so it is only meaningful relative to one view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Rank(u32);

impl Rank {
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Group structure
// ============================================================================

/// Identifier of a subgroup (one replicated state machine).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SubgroupId(u32);

impl SubgroupId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for SubgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a shard within its subgroup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShardNum(u32);

impl ShardNum {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for ShardNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing identifier of an installed view.
///
/// View ids strictly increase across installs at every member.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId(i32);

impl ViewId {
    pub const ZERO: ViewId = ViewId(0);

    pub const fn new(vid: i32) -> Self {
        Self(vid)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message identities
// ============================================================================

/// Zero-based count of messages from one sender within the current view.
pub type MessageIndex = i32;

/// A position in the dense global order of one shard.
///
/// Sequence numbers interleave senders round-robin: the message with
/// per-sender index `i` from the sender with sender-rank `k` occupies
/// global sequence `k + num_senders * i`. With 3 senders the in-order
/// stream is `(0,0), (1,0), (2,0), (0,1), …` = `0, 1, 2, 3, …`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// The frontier value before any message has been received.
    pub const NONE: SequenceNumber = SequenceNumber(-1);

    pub const fn new(seq: i64) -> Self {
        Self(seq)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Builds the global sequence for `(sender_rank, index)` in a shard
    /// with `num_senders` senders.
    pub fn from_parts(sender_rank: u32, index: MessageIndex, num_senders: u32) -> Self {
        Self(i64::from(sender_rank) + i64::from(num_senders) * i64::from(index))
    }

    /// The sender-rank component of this sequence number.
    pub fn sender_rank(self, num_senders: u32) -> u32 {
        (self.0.rem_euclid(i64::from(num_senders))) as u32
    }

    /// The per-sender index component of this sequence number.
    pub fn index(self, num_senders: u32) -> MessageIndex {
        (self.0.div_euclid(i64::from(num_senders))) as MessageIndex
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for SequenceNumber {
    fn default() -> Self {
        Self::NONE
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persistent version number within one subgroup.
///
/// Versions are assigned by the multicast engine at delivery time from a
/// per-subgroup monotonic counter and recorded by the persistence layer
/// together with the message's sender timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(i64);

impl Version {
    /// Sentinel for "no version yet".
    pub const INVALID: Version = Version(-1);

    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Change proposals
// ============================================================================

/// A proposal to add or remove one node from the view.
///
/// Carries the id of the leader that proposed the change. `end_of_view`
/// delimits proposals made by a previous leader: when leadership moves,
/// the new leader appends a marker proposal so that members can ignore
/// the departed leader's uncommitted tail when tallying. Node ids never
/// exceed 16 bits in practice, so both ids pack into one 32-bit word in
/// the shared state table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub struct ChangeProposal {
    pub leader_id: u16,
    pub change_id: u16,
    pub end_of_view: bool,
}

impl ChangeProposal {
    pub fn new(leader_id: u16, change_id: u16) -> Self {
        Self {
            leader_id,
            change_id,
            end_of_view: false,
        }
    }

    pub fn end_of_view(leader_id: u16) -> Self {
        Self {
            leader_id,
            change_id: 0,
            end_of_view: true,
        }
    }

    /// The node this proposal adds or removes.
    pub fn node(self) -> NodeId {
        NodeId::new(u32::from(self.change_id))
    }
}

// ============================================================================
// Shard delivery parameters
// ============================================================================

/// Delivery discipline of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    /// Totally ordered delivery: every member delivers the same global
    /// round-robin prefix.
    #[default]
    Ordered,
    /// Best-effort delivery with no cross-sender ordering.
    Unordered,
}

/// Block dissemination algorithm used by the bulk multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SendAlgorithm {
    /// Binomial pipeline: blocks spread doubling-tree style each round.
    #[default]
    Binomial,
    /// Each block hops member to member in rank order.
    Chain,
    /// The sender transmits every block to every receiver itself.
    Sequential,
    /// Blocks fan out along a binary tree rooted at the sender.
    Tree,
}

impl FromStr for SendAlgorithm {
    type Err = UnknownSendAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binomial_send" => Ok(Self::Binomial),
            "chain_send" => Ok(Self::Chain),
            "sequential_send" => Ok(Self::Sequential),
            "tree_send" => Ok(Self::Tree),
            other => Err(UnknownSendAlgorithm(other.to_string())),
        }
    }
}

impl Display for SendAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Binomial => "binomial_send",
            Self::Chain => "chain_send",
            Self::Sequential => "sequential_send",
            Self::Tree => "tree_send",
        };
        f.write_str(s)
    }
}

/// Error for an unrecognized `send_algorithm` configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown send algorithm {0:?}; expected one of binomial_send, chain_send, sequential_send, tree_send")]
pub struct UnknownSendAlgorithm(pub String);

/// Low-level multicast parameters of one shard, resolved from a
/// `[SUBGROUP/<name>]` configuration profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProfile {
    /// Largest user payload accepted by `send`, in bytes.
    pub max_payload_size: u64,
    /// Largest payload of a reply to an RPC-style (cooked) message.
    pub max_reply_payload_size: u64,
    /// Payloads at or below this size travel through the small-message
    /// path (state table slots) instead of the bulk multicast.
    pub max_smc_payload_size: u64,
    /// Bulk multicast block size, in bytes.
    pub block_size: u64,
    /// Number of in-progress messages allowed per sender before `send`
    /// blocks.
    pub window_size: u32,
    /// Bulk dissemination algorithm.
    pub send_algorithm: SendAlgorithm,
}

impl ShardProfile {
    /// Total buffer size for one bulk message: payload plus header,
    /// rounded up to a whole number of blocks when the bulk path can be
    /// used at all.
    pub fn max_msg_size(&self) -> u64 {
        let raw = self.max_payload_size + HEADER_SIZE as u64;
        if self.max_payload_size > self.max_smc_payload_size && raw % self.block_size != 0 {
            (raw / self.block_size + 1) * self.block_size
        } else {
            raw
        }
    }

    /// Buffer size for one small-message slot: payload plus header.
    pub fn slot_size(&self) -> u64 {
        self.max_smc_payload_size + HEADER_SIZE as u64
    }
}

impl Default for ShardProfile {
    fn default() -> Self {
        Self {
            max_payload_size: 10_240,
            max_reply_payload_size: 10_240,
            max_smc_payload_size: 10_240,
            block_size: 1_048_576,
            window_size: 16,
            send_algorithm: SendAlgorithm::Binomial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_round_robin_mapping() {
        // 3 senders: (rank, index) -> rank + 3*index.
        let s = SequenceNumber::from_parts(2, 4, 3);
        assert_eq!(s.as_i64(), 14);
        assert_eq!(s.sender_rank(3), 2);
        assert_eq!(s.index(3), 4);
    }

    #[test]
    fn sequence_dense_prefix() {
        // With 4 senders the first eight sequences are exactly the
        // round-robin interleaving of indices 0 and 1.
        for seq in 0..8i64 {
            let s = SequenceNumber::new(seq);
            assert_eq!(s.sender_rank(4), (seq % 4) as u32);
            assert_eq!(s.index(4), (seq / 4) as i32);
        }
    }

    #[test]
    fn change_proposal_node_id() {
        let p = ChangeProposal::new(1, 7);
        assert_eq!(p.node(), NodeId::new(7));
        assert!(!p.end_of_view);
        assert!(ChangeProposal::end_of_view(3).end_of_view);
    }

    #[test]
    fn send_algorithm_parse_and_display() {
        for name in ["binomial_send", "chain_send", "sequential_send", "tree_send"] {
            let alg: SendAlgorithm = name.parse().unwrap();
            assert_eq!(alg.to_string(), name);
        }
        assert!("bitonic_send".parse::<SendAlgorithm>().is_err());
    }

    #[test]
    fn max_msg_size_rounds_to_blocks() {
        let profile = ShardProfile {
            max_payload_size: 100_000,
            max_smc_payload_size: 10_000,
            block_size: 4_096,
            ..ShardProfile::default()
        };
        let size = profile.max_msg_size();
        assert_eq!(size % 4_096, 0);
        assert!(size >= 100_000 + HEADER_SIZE as u64);
    }

    #[test]
    fn small_only_profile_is_not_rounded() {
        let profile = ShardProfile {
            max_payload_size: 1_000,
            max_smc_payload_size: 10_000,
            block_size: 4_096,
            ..ShardProfile::default()
        };
        assert_eq!(profile.max_msg_size(), 1_000 + HEADER_SIZE as u64);
    }
}
