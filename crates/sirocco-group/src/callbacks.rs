//! Delivery event callbacks.
//!
//! Two bundles: the user-supplied set (what applications observe) and
//! the internal set wired up by the group assembly (version posting,
//! RPC dispatch, frontier notifications). All callbacks run on engine
//! threads (the predicate thread for delivery, the persistence thread
//! for durability events) and must not block.

use std::sync::Arc;

use bytes::Bytes;
use sirocco_types::{NodeId, SubgroupId, Version};

/// `(subgroup, sender, index, payload, version)` for each delivered
/// message, in the shard's global round-robin order.
pub type StabilityCallback =
    dyn Fn(SubgroupId, NodeId, i32, Option<&Bytes>, Version) + Send + Sync;

/// `(subgroup, version)` once a version is durable on every shard
/// member.
pub type PersistenceCallback = dyn Fn(SubgroupId, Version) + Send + Sync;

/// `(subgroup, version)` once every shard member's signature over a
/// version has been verified locally.
pub type VerifiedCallback = dyn Fn(SubgroupId, Version) + Send + Sync;

/// Callbacks supplied by the application.
#[derive(Clone, Default)]
pub struct UserCallbacks {
    pub stability: Option<Arc<StabilityCallback>>,
    pub local_persistence: Option<Arc<PersistenceCallback>>,
    pub global_persistence: Option<Arc<PersistenceCallback>>,
    pub global_verified: Option<Arc<VerifiedCallback>>,
}

/// `(subgroup, version, timestamp)` posted just before a message is
/// delivered, so replicated-object plumbing knows the version being
/// handled.
pub type PostNextVersionCallback = dyn Fn(SubgroupId, Version, u64) + Send + Sync;

/// Dispatch target for cooked (RPC-style) messages.
pub type RpcCallback = dyn Fn(SubgroupId, NodeId, &Bytes, Version) + Send + Sync;

/// Internal callbacks, distinct from the user set: these keep the
/// replicated-object and persistence plumbing informed regardless of
/// what the application registered.
#[derive(Clone, Default)]
pub struct EngineCallbacks {
    pub user: UserCallbacks,
    pub post_next_version: Option<Arc<PostNextVersionCallback>>,
    pub rpc: Option<Arc<RpcCallback>>,
    pub internal_persistence: Option<Arc<PersistenceCallback>>,
    pub internal_verified: Option<Arc<VerifiedCallback>>,
}

impl EngineCallbacks {
    pub(crate) fn notify_global_persistence(&self, subgroup: SubgroupId, version: Version) {
        if let Some(cb) = &self.internal_persistence {
            cb(subgroup, version);
        }
        if let Some(cb) = &self.user.global_persistence {
            cb(subgroup, version);
        }
    }

    pub(crate) fn notify_global_verified(&self, subgroup: SubgroupId, version: Version) {
        if let Some(cb) = &self.internal_verified {
            cb(subgroup, version);
        }
        if let Some(cb) = &self.user.global_verified {
            cb(subgroup, version);
        }
    }
}
