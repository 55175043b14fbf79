//! # sirocco-rbm: reliable bulk multicast
//!
//! Disseminates large payloads from one sender to every other member of
//! a dissemination group over a reliable block transport. A payload is
//! split into fixed-size blocks; a precomputed schedule (binomial
//! pipeline, chain, sequential, or tree) says which member relays
//! which block to whom, so the sender's uplink is not the only edge
//! doing work. Receivers reassemble blocks and hand completed messages
//! to a completion callback in per-sender FIFO order.
//!
//! The block transport is abstract: one operation, "write this block to
//! that member, reliably and in order". Tests and in-process simulations
//! use [`LoopbackTransport`]; a deployment provides its own (TCP, RDMA
//! write, …).
//!
//! Each (shard, sender) pair gets its own group; the engine numbers them
//! `rdmc_group_num_offset + sender_rank` so concurrent senders of one
//! shard never share reassembly state.

mod group;
mod loopback;
mod schedule;

pub use group::{BlockFrame, BlockTransport, RbmGroup};
pub use loopback::LoopbackTransport;
pub use schedule::{schedule, Transfer};

use sirocco_types::NodeId;

/// Errors from bulk multicast operations.
#[derive(Debug, thiserror::Error)]
pub enum RbmError {
    #[error("this member is not the sender of group {group_id}")]
    NotSender { group_id: u64 },

    #[error("empty payloads cannot be multicast")]
    EmptyPayload,

    #[error("member {node} is unreachable")]
    Unreachable { node: NodeId },

    #[error("block transport failed: {reason}")]
    Transport { reason: String },

    #[error("block frame for unknown group {group_id}")]
    UnknownGroup { group_id: u64 },

    #[error(
        "inconsistent frame for group {group_id} message {msg_seq}: {reason}"
    )]
    InconsistentFrame {
        group_id: u64,
        msg_seq: u64,
        reason: &'static str,
    },
}
