//! The public group assembly.
//!
//! [`Group`] wires configuration, fabric, transport, view manager, and
//! the subgroup type registry into one object an application holds.
//! Replicated-object types are registered by a stable [`TypeTag`]
//! mapped to a factory; at the API surface subgroups are addressed by
//! tag + index and accessed through [`SubgroupHandle`], which exposes
//! ordered sends and the stability/persistence/verification frontiers.
//!
//! The registry is deliberately dynamic; a tag keys a factory and a
//! type-erased object table; so the set of replicated types is data,
//! not a compile-time pack, and handles stay thin capabilities with no
//! back-pointer into the engine.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sirocco_config::{Layout, SiroccoConfig};
use sirocco_crypto::{SigningIdentity, VerifyingIdentity};
use sirocco_rbm::{BlockTransport, LoopbackTransport};
use sirocco_sst::{MemoryFabric, RowFabric};
use sirocco_types::{
    DeliveryMode, MemberAddress, NodeId, ShardProfile, SubView, SubgroupId, Version, View,
};
use tracing::{debug, warn};

use crate::callbacks::{EngineCallbacks, UserCallbacks};
use crate::view_manager::{
    restart_rendezvous, Binder, Provisioner, RestartConfig, RestartOutcome, ViewManager, VmConfig,
};
use crate::GroupError;

/// Stable identifier of a registered replicated-object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(pub u32);

/// Factory producing one replicated object instance per subgroup.
pub type ObjectFactory = Box<dyn Fn(SubgroupId) -> Box<dyn Any + Send> + Send + Sync>;

struct TypeEntry {
    /// Layout subgroup name prefix this type claims (`"cache"` claims
    /// `cache`, `cache_0`, …).
    name: String,
    factory: ObjectFactory,
    objects: Mutex<BTreeMap<u32, Box<dyn Any + Send>>>,
}

/// Internal opcode prefix on cooked payloads. User RPC dispatch rides
/// opcode 0; the barrier marker is the engine's own.
const COOKED_USER: u8 = 0;
const COOKED_BARRIER: u8 = 1;

#[derive(Default)]
struct BarrierState {
    /// `(subgroup, generation)` → nodes whose marker has been
    /// delivered.
    arrived: HashMap<(SubgroupId, u64), HashSet<NodeId>>,
    next_generation: u64,
}

// ============================================================================
// Builder
// ============================================================================

/// Builds a [`Group`] from node configuration plus deployment plumbing.
pub struct GroupBuilder {
    config: SiroccoConfig,
    callbacks: UserCallbacks,
    fabric: Option<Arc<dyn RowFabric>>,
    transport: Option<Arc<dyn BlockTransport>>,
    binder: Option<Binder>,
    types: Vec<(TypeTag, String, ObjectFactory)>,
    peer_keys: BTreeMap<NodeId, VerifyingIdentity>,
    persist_dir_override: Option<PathBuf>,
}

impl GroupBuilder {
    pub fn new(config: SiroccoConfig) -> Self {
        Self {
            config,
            callbacks: UserCallbacks::default(),
            fabric: None,
            transport: None,
            binder: None,
            types: Vec::new(),
            peer_keys: BTreeMap::new(),
            persist_dir_override: None,
        }
    }

    /// Registers a peer's public key for verifying its version
    /// signatures. Without a peer's key, its signatures cannot be
    /// checked and the verified frontier will not advance past it.
    pub fn peer_key(mut self, node: NodeId, key: VerifyingIdentity) -> Self {
        self.peer_keys.insert(node, key);
        self
    }

    pub fn callbacks(mut self, callbacks: UserCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Registers a replicated-object type for the layout subgroups
    /// whose name matches `name`.
    pub fn register_type(mut self, tag: TypeTag, name: &str, factory: ObjectFactory) -> Self {
        self.types.push((tag, name.to_string(), factory));
        self
    }

    /// Supplies deployment plumbing explicitly: a row fabric, a block
    /// transport, and the binder that attaches per-view tables and
    /// dissemination endpoints to them.
    pub fn plumbing(
        mut self,
        fabric: Arc<dyn RowFabric>,
        transport: Arc<dyn BlockTransport>,
        binder: Binder,
    ) -> Self {
        self.fabric = Some(fabric);
        self.transport = Some(transport);
        self.binder = Some(binder);
        self
    }

    /// In-process plumbing: every node of the group lives in this
    /// address space (tests, simulations, single-host rigs).
    pub fn in_process(
        self,
        fabric: Arc<MemoryFabric>,
        transport: Arc<LoopbackTransport>,
        my_node: NodeId,
    ) -> Self {
        let bind_fabric = fabric.clone();
        let bind_transport = transport.clone();
        let binder: Binder = Arc::new(move |sst, groups| {
            bind_fabric.register(my_node, sst);
            for group in groups {
                bind_transport.register(my_node, group);
            }
        });
        self.plumbing(fabric, transport, binder)
    }

    /// Overrides `[PERS] file_path` (multi-node-per-host test rigs give
    /// each node its own directory).
    pub fn persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir_override = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Group, GroupError> {
        sirocco_config::init_logging(&self.config.logger);
        let config = self.config;
        let my_node = NodeId::new(config.core.local_id);
        let fabric = self.fabric.ok_or(GroupError::MissingPlumbing)?;
        let transport = self.transport.ok_or(GroupError::MissingPlumbing)?;
        let binder = self.binder.ok_or(GroupError::MissingPlumbing)?;

        let persist_dir = self
            .persist_dir_override
            .unwrap_or_else(|| PathBuf::from(&config.pers.file_path));

        let signer = match &config.pers.private_key_file {
            Some(path) => Some(Arc::new(SigningIdentity::from_key_file(
                std::path::Path::new(path),
            )?)),
            None => None,
        };

        // Subgroup ids follow layout order; the provisioner rebuilds
        // shard assignments for any roster, deterministically.
        let mut subgroup_ids = BTreeMap::new();
        let mut profiles = BTreeMap::new();
        for (i, sg) in config.layout.subgroups.iter().enumerate() {
            let id = SubgroupId::new(i as u32);
            subgroup_ids.insert(sg.name.clone(), id);
            let profile = match &sg.profile {
                Some(name) => config.profile_for(name)?,
                None => config
                    .default_profile
                    .as_ref()
                    .map(ShardProfile::from)
                    .unwrap_or_default(),
            };
            profiles.insert(id, profile);
        }
        let provisioner = make_provisioner(config.layout.clone(), profiles);

        let my_address = MemberAddress {
            ip: config
                .core
                .local_ip
                .parse()
                .unwrap_or(std::net::Ipv4Addr::LOCALHOST),
            gms_port: config.core.gms_port,
            state_transfer_port: config.core.state_transfer_port,
            sst_port: config.core.sst_port,
            rbm_port: config.core.rdmc_port,
            external_port: config.core.external_port,
        };

        let barrier = Arc::new((Mutex::new(BarrierState::default()), Condvar::new()));
        let rpc_barrier = barrier.clone();
        let engine_callbacks = EngineCallbacks {
            user: self.callbacks,
            post_next_version: None,
            rpc: Some(Arc::new(move |subgroup, sender, payload, _version| {
                dispatch_cooked(&rpc_barrier, subgroup, sender, payload);
            })),
            internal_persistence: None,
            internal_verified: None,
        };

        let vm = ViewManager::new(
            VmConfig {
                my_node,
                my_address,
                heartbeat: Duration::from_millis(u64::from(config.core.heartbeat_ms)),
                suspect_timeout: Duration::from_millis(config.core.sst_poll_cq_timeout_ms),
                sender_timeout: Duration::from_millis(config.core.sst_poll_cq_timeout_ms),
                disable_partitioning_safety: config.core.disable_partitioning_safety,
                persist_dir: persist_dir.clone(),
                persist_reset: config.pers.reset,
                max_log_entry: config.pers.max_log_entry,
                max_data_size: config.pers.max_data_size,
                signer,
                peer_keys: self.peer_keys,
                restart_timeout: Duration::from_millis(config.core.restart_timeout_ms),
            },
            fabric,
            transport,
            engine_callbacks,
            provisioner,
            binder,
        )?;

        let mut registry = BTreeMap::new();
        for (tag, name, factory) in self.types {
            registry.insert(
                tag,
                TypeEntry {
                    name,
                    factory,
                    objects: Mutex::new(BTreeMap::new()),
                },
            );
        }

        Ok(Group {
            config,
            my_node,
            persist_dir,
            vm,
            registry,
            subgroup_ids,
            barrier,
        })
    }
}

fn dispatch_cooked(
    barrier: &Arc<(Mutex<BarrierState>, Condvar)>,
    subgroup: SubgroupId,
    sender: NodeId,
    payload: &Bytes,
) {
    match payload.first() {
        Some(&COOKED_BARRIER) if payload.len() >= 9 => {
            let gen = u64::from_le_bytes(payload[1..9].try_into().expect("checked length"));
            let (lock, cv) = barrier.as_ref();
            let mut state = lock.lock().expect("barrier state poisoned");
            state
                .arrived
                .entry((subgroup, gen))
                .or_default()
                .insert(sender);
            cv.notify_all();
        }
        Some(&COOKED_USER) => {
            // Per-object RPC dispatch sits above the core; the payload
            // is available to it through the registered callbacks.
            debug!(%subgroup, %sender, "cooked user message delivered without a dispatcher");
        }
        _ => {
            warn!(%subgroup, %sender, "cooked message with unknown opcode dropped");
        }
    }
}

/// Builds the deterministic roster → shard-assignment function from the
/// configured layout.
fn make_provisioner(
    layout: Layout,
    profiles: BTreeMap<SubgroupId, ShardProfile>,
) -> Provisioner {
    Arc::new(move |roster: &[NodeId]| {
        let mut shards_by_subgroup = BTreeMap::new();
        for (i, sg) in layout.subgroups.iter().enumerate() {
            let id = SubgroupId::new(i as u32);
            let profile = profiles.get(&id).copied().unwrap_or_default();
            let mode = match sg.mode {
                sirocco_config::LayoutMode::Ordered => DeliveryMode::Ordered,
                sirocco_config::LayoutMode::Unordered => DeliveryMode::Unordered,
            };
            let mut shards = Vec::new();
            for shard in &sg.shards {
                let members: Vec<NodeId> = shard
                    .members
                    .iter()
                    .map(|m| NodeId::new(*m))
                    .filter(|m| roster.contains(m))
                    .collect();
                if members.is_empty() {
                    // A shard with nobody alive cannot host its state.
                    return Err(GroupError::NotProvisioned { subgroup: id });
                }
                let mut subview = SubView::new(mode, members, profile);
                if let Some(senders) = &shard.senders {
                    let senders: Vec<NodeId> =
                        senders.iter().map(|s| NodeId::new(*s)).collect();
                    subview = subview.with_senders(&senders);
                }
                shards.push(subview);
            }
            shards_by_subgroup.insert(id, shards);
        }
        Ok(shards_by_subgroup)
    })
}

// ============================================================================
// Group
// ============================================================================

/// One process's membership in the group: the view manager plus the
/// replicated-object registry.
pub struct Group {
    config: SiroccoConfig,
    my_node: NodeId,
    persist_dir: PathBuf,
    vm: Arc<ViewManager>,
    registry: BTreeMap<TypeTag, TypeEntry>,
    subgroup_ids: BTreeMap<String, SubgroupId>,
    barrier: Arc<(Mutex<BarrierState>, Condvar)>,
}

impl Group {
    /// Founds the group with a simultaneous-start roster. Every
    /// founding member calls this with the same list.
    pub fn start_founding(
        &self,
        roster: Vec<(NodeId, MemberAddress)>,
    ) -> Result<(), GroupError> {
        self.vm.bootstrap(roster)?;
        self.instantiate_objects();
        Ok(())
    }

    /// Joins a running group through its leader.
    pub fn join_existing(&self, contact: SocketAddr, timeout: Duration) -> Result<(), GroupError> {
        self.vm.join(contact, timeout)?;
        self.instantiate_objects();
        Ok(())
    }

    /// Recovers the group after a total failure: rendezvous on the
    /// configured restart leaders, then install the recovery view.
    pub fn restart(&self) -> Result<(), GroupError> {
        let core = &self.config.core;
        let leaders: Vec<SocketAddr> = core
            .restart_leaders
            .iter()
            .zip(&core.restart_leader_ports)
            .filter_map(|(ip, port)| ip.parse().ok().map(|ip| SocketAddr::new(ip, *port)))
            .collect();
        // A node recognizes itself as leader k by IP; rigs that pack
        // several nodes onto one host drive the rendezvous directly via
        // `restart_with`.
        let my_leader_index = core
            .restart_leaders
            .iter()
            .position(|ip| *ip == core.local_ip);
        let outcome = restart_rendezvous(
            &RestartConfig {
                my_node: self.my_node,
                my_address: self.vm_address(),
                leaders,
                my_leader_index,
                restart_timeout: Duration::from_millis(core.restart_timeout_ms),
                enable_backup_leaders: core.enable_backup_restart_leaders,
                subgroups: self.subgroup_ids.values().copied().collect(),
                max_log_entry: self.config.pers.max_log_entry,
                max_data_size: self.config.pers.max_data_size,
            },
            &self.persist_dir,
        )?;
        self.restart_with(outcome)
    }

    /// Installs a restart outcome computed by an external rendezvous
    /// (test rigs drive the rendezvous themselves).
    pub fn restart_with(&self, outcome: RestartOutcome) -> Result<(), GroupError> {
        self.vm.bootstrap_restart(outcome)?;
        self.instantiate_objects();
        Ok(())
    }

    fn vm_address(&self) -> MemberAddress {
        let view = self.vm.current_view();
        view.addresses[view.my_rank.as_usize()]
    }

    fn instantiate_objects(&self) {
        let view = self.vm.current_view();
        for entry in self.registry.values() {
            let mut objects = entry.objects.lock().expect("object table poisoned");
            let matching = self
                .subgroup_ids
                .iter()
                .filter(|(name, _)| name.starts_with(&entry.name))
                .map(|(_, id)| *id)
                .enumerate();
            for (index, id) in matching {
                let member = view
                    .subgroup_shards
                    .get(&id)
                    .is_some_and(|shards| {
                        shards.iter().any(|s| s.rank_of(self.my_node).is_some())
                    });
                if member {
                    objects
                        .entry(index as u32)
                        .or_insert_with(|| (entry.factory)(id));
                }
            }
        }
    }

    /// The view manager, for membership queries and failure reports.
    pub fn view_manager(&self) -> &Arc<ViewManager> {
        &self.vm
    }

    pub fn current_view(&self) -> Arc<View> {
        self.vm.current_view()
    }

    /// A thin capability for one subgroup this node belongs to.
    /// Addressing is tag + index into the subgroups claimed by that
    /// tag's name.
    pub fn get_subgroup(&self, tag: TypeTag, index: u32) -> Result<SubgroupHandle, GroupError> {
        let entry = self
            .registry
            .get(&tag)
            .ok_or(GroupError::InvalidSubgroup {
                subgroup: SubgroupId::new(index),
            })?;
        let matching: Vec<SubgroupId> = self
            .subgroup_ids
            .iter()
            .filter(|(name, _)| name.starts_with(&entry.name))
            .map(|(_, id)| *id)
            .collect();
        let subgroup = matching
            .get(index as usize)
            .copied()
            .ok_or(GroupError::InvalidSubgroup {
                subgroup: SubgroupId::new(index),
            })?;
        // Membership gate: handles exist only for subgroups this node
        // is in.
        let view = self.vm.current_view();
        let member = view
            .subgroup_shards
            .get(&subgroup)
            .is_some_and(|shards| shards.iter().any(|s| s.rank_of(self.my_node).is_some()));
        if !member {
            return Err(GroupError::InvalidSubgroup { subgroup });
        }
        Ok(SubgroupHandle {
            subgroup,
            my_node: self.my_node,
            vm: self.vm.clone(),
            barrier: self.barrier.clone(),
        })
    }

    /// By-name lookup, for callers that think in layout names.
    pub fn subgroup_id(&self, name: &str) -> Option<SubgroupId> {
        self.subgroup_ids.get(name).copied()
    }

    pub fn leave(&self, timeout: Duration) -> Result<(), GroupError> {
        self.vm.leave(timeout)
    }

    pub fn shutdown(&self) {
        self.vm.shutdown();
    }
}

// ============================================================================
// Subgroup handles
// ============================================================================

/// Capability for one subgroup: sends and frontier queries. No
/// back-pointer into engine internals; the handle resolves the live
/// engine through the view manager on every call, so it stays valid
/// across view changes.
#[derive(Clone)]
pub struct SubgroupHandle {
    subgroup: SubgroupId,
    my_node: NodeId,
    vm: Arc<ViewManager>,
    barrier: Arc<(Mutex<BarrierState>, Condvar)>,
}

impl SubgroupHandle {
    pub fn subgroup_id(&self) -> SubgroupId {
        self.subgroup
    }

    /// Totally ordered multicast of `payload` to this subgroup's shard.
    pub fn ordered_send(&self, payload: &[u8]) -> Result<bool, GroupError> {
        let engine = self.vm.engine()?;
        engine.send(
            self.subgroup,
            payload.len(),
            |buf| buf.copy_from_slice(payload),
            false,
        )
    }

    /// Ordered send of an RPC-style payload, dispatched to the cooked
    /// handler at every member.
    pub fn cooked_send(&self, payload: &[u8]) -> Result<bool, GroupError> {
        let engine = self.vm.engine()?;
        engine.send(
            self.subgroup,
            payload.len() + 1,
            |buf| {
                buf[0] = COOKED_USER;
                buf[1..].copy_from_slice(payload);
            },
            true,
        )
    }

    /// Members of this node's shard, in shard order.
    pub fn get_subgroup_members(&self) -> Vec<NodeId> {
        let view = self.vm.current_view();
        view.subgroup_shards
            .get(&self.subgroup)
            .and_then(|shards| {
                shards
                    .iter()
                    .find(|s| s.rank_of(self.my_node).is_some())
                    .map(|s| s.members.clone())
            })
            .unwrap_or_default()
    }

    pub fn get_global_persistence_frontier(&self) -> Result<Version, GroupError> {
        Ok(self.vm.engine()?.get_global_persistence_frontier(self.subgroup))
    }

    pub fn wait_for_global_persistence_frontier(
        &self,
        version: Version,
    ) -> Result<bool, GroupError> {
        self.vm
            .engine()?
            .wait_for_global_persistence_frontier(self.subgroup, version)
    }

    pub fn get_global_verified_frontier(&self) -> Result<Version, GroupError> {
        Ok(self.vm.engine()?.get_global_verified_frontier(self.subgroup))
    }

    /// Real-time stability frontier (ns): every shard member has
    /// reached at least this timestamp.
    pub fn compute_global_stability_frontier(&self) -> Result<u64, GroupError> {
        Ok(self
            .vm
            .engine()?
            .compute_global_stability_frontier(self.subgroup))
    }

    /// Blocks until every shard member has entered the same barrier
    /// generation. Rides a cooked marker through the ordered stream, so
    /// it doubles as a full-stream flush.
    pub fn barrier_sync(&self, timeout: Duration) -> Result<(), GroupError> {
        let generation = {
            let (lock, _) = self.barrier.as_ref();
            let mut state = lock.lock().expect("barrier state poisoned");
            state.next_generation += 1;
            state.next_generation
        };
        let engine = self.vm.engine()?;
        let mut marker = [0u8; 9];
        marker[0] = COOKED_BARRIER;
        marker[1..9].copy_from_slice(&generation.to_le_bytes());
        let sent = engine.send(
            self.subgroup,
            marker.len(),
            |buf| buf.copy_from_slice(&marker),
            true,
        )?;
        if !sent {
            return Err(GroupError::Shutdown);
        }

        let expected = self.get_subgroup_members().len();
        let deadline = std::time::Instant::now() + timeout;
        let (lock, cv) = self.barrier.as_ref();
        let mut state = lock.lock().expect("barrier state poisoned");
        loop {
            let arrived = state
                .arrived
                .get(&(self.subgroup, generation))
                .map(HashSet::len)
                .unwrap_or(0);
            if arrived >= expected {
                state.arrived.remove(&(self.subgroup, generation));
                return Ok(());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(GroupError::Control(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "barrier did not complete in time",
                )));
            }
            let (next, _) = cv
                .wait_timeout(state, deadline - now)
                .expect("barrier state poisoned");
            state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioner_filters_to_roster() {
        let layout = Layout::from_json(
            r#"[
                { "name": "cache", "shards": [ { "members": [1, 2, 3] } ] },
                { "name": "meta", "shards": [ { "members": [2, 3], "senders": [3] } ] }
            ]"#,
        )
        .unwrap();
        let provisioner = make_provisioner(layout, BTreeMap::new());

        let roster: Vec<NodeId> = [1, 3].iter().copied().map(NodeId::new).collect();
        let shards = provisioner(&roster).unwrap();
        assert_eq!(
            shards[&SubgroupId::new(0)][0].members,
            vec![NodeId::new(1), NodeId::new(3)]
        );
        assert_eq!(
            shards[&SubgroupId::new(1)][0].members,
            vec![NodeId::new(3)]
        );
        assert_eq!(shards[&SubgroupId::new(1)][0].num_senders(), 1);
    }

    #[test]
    fn empty_shard_is_not_provisioned() {
        let layout = Layout::from_json(
            r#"[ { "name": "cache", "shards": [ { "members": [5, 6] } ] } ]"#,
        )
        .unwrap();
        let provisioner = make_provisioner(layout, BTreeMap::new());
        let roster = vec![NodeId::new(1)];
        assert!(matches!(
            provisioner(&roster),
            Err(GroupError::NotProvisioned { .. })
        ));
    }

    #[test]
    fn barrier_marker_layout() {
        let mut marker = [0u8; 9];
        marker[0] = COOKED_BARRIER;
        marker[1..9].copy_from_slice(&7u64.to_le_bytes());
        let barrier = Arc::new((Mutex::new(BarrierState::default()), Condvar::new()));
        dispatch_cooked(
            &barrier,
            SubgroupId::new(0),
            NodeId::new(2),
            &Bytes::copy_from_slice(&marker),
        );
        let state = barrier.0.lock().unwrap();
        assert_eq!(
            state.arrived[&(SubgroupId::new(0), 7)],
            HashSet::from([NodeId::new(2)])
        );
    }
}
