//! # sirocco-group: the group communication core
//!
//! Two tightly-coupled components over one shared state table:
//!
//! - The **multicast engine** ([`MulticastEngine`]) delivers a totally
//!   ordered, reliable, at-most-once multicast stream within each shard
//!   the local process belongs to, tracking per-message stability,
//!   persistence, and signature-verification frontiers.
//! - The **view manager** ([`ViewManager`]) detects failures, proposes
//!   and commits membership changes, and drives the engine through view
//!   changes: wedge, drain to an agreed trim frontier, install the next
//!   view, resume.
//!
//! They are mutually recursive by construction (the engine needs a
//! stable membership and a wedge/drain contract; the view manager
//! needs the engine's in-flight accounting to cut a clean frontier),
//! yet neither holds a pointer into the other. Both observe the shared
//! state table through predicate registrations and share state through
//! `Arc`s of their own interior-mutable cores.
//!
//! [`Group`] is the public assembly: configuration in, subgroup handles
//! out.

mod callbacks;
mod control;
mod engine;
mod group;
mod settings;
mod view_manager;

pub use callbacks::{EngineCallbacks, UserCallbacks};
pub use control::{ControlConnection, ControlFrame, ControlServer, StateBlob};
pub use engine::{EngineConfig, MulticastEngine, PreservedState};
pub use group::{Group, GroupBuilder, SubgroupHandle, TypeTag};
pub use settings::{build_settings, build_schema, SubgroupSettings};
pub use view_manager::{
    restart_rendezvous, Binder, Provisioner, RestartConfig, RestartOutcome, ViewManager,
    VmConfig, VmStatus,
};

use sirocco_types::SubgroupId;

/// Errors from group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error(transparent)]
    Config(#[from] sirocco_config::ConfigError),

    #[error(transparent)]
    Sst(#[from] sirocco_sst::SstError),

    #[error(transparent)]
    Rbm(#[from] sirocco_rbm::RbmError),

    #[error(transparent)]
    Persist(#[from] sirocco_persist::PersistError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] sirocco_crypto::KeyError),

    #[error("control channel I/O failed: {0}")]
    Control(#[from] std::io::Error),

    #[error("control frame codec failed: {0}")]
    Codec(#[from] postcard::Error),

    /// The caller asked for a subgroup it is not a member of.
    #[error("this node is not a member of subgroup {subgroup}")]
    InvalidSubgroup { subgroup: SubgroupId },

    /// The proposed view cannot host the configured layout yet. The
    /// caller waits for more nodes and retries.
    #[error("subgroup {subgroup} is not adequately provisioned in this view")]
    NotProvisioned { subgroup: SubgroupId },

    /// The proposed view loses the majority of its predecessor.
    #[error(
        "refusing view {vid}: {surviving} of {previous} previous members survive, majority required"
    )]
    PartitioningUnsafe {
        vid: i32,
        surviving: usize,
        previous: usize,
    },

    #[error("this node is not listed in the configured layout")]
    NotInLayout,

    #[error("group builder is missing its fabric/transport plumbing")]
    MissingPlumbing,

    #[error("the group is shutting down")]
    Shutdown,

    #[error("restart rendezvous timed out after {timeout_ms} ms with {reached} of {needed} nodes")]
    RestartTimeout {
        timeout_ms: u64,
        reached: usize,
        needed: usize,
    },
}
