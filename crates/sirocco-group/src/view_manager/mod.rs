//! The view manager.
//!
//! Owns the sequence of installed views and drives the engine through
//! view changes. Failure detection, membership proposals, and the
//! commit/install barriers all run over the shared state table; the
//! TCP control channel only carries what the table cannot: join
//! handshakes, view hand-offs to joiners, and shard state transfer.
//!
//! The change protocol is leader-coordinated two-phase commit over the
//! table's membership columns:
//!
//! 1. **Propose**: the leader appends [`ChangeProposal`]s and bumps
//!    `num_changes` (join proposals also fill the joiner address
//!    columns).
//! 2. **Ack**: members mirror the leader's proposals and raise
//!    `num_acked`.
//! 3. **Commit**: the leader raises `num_committed` to the minimum
//!    acked count across live rows.
//! 4. **Wedge & drain**: everyone wedges its engine; each shard's
//!    leader publishes the per-sender trim (`global_min`).
//! 5. **Ragged trim**: members force-deliver exactly to the agreed
//!    frontier and discard the rest.
//! 6. **Install**: members raise `num_installed`; once every live row
//!    has installed, each constructs the identical next view, rebuilds
//!    table and engine, and resumes.
//!
//! When leadership moves, the new leader appends an end-of-view marker
//! so members discard the failed leader's uncommitted tail.
//!
//! Per-process lifecycle: `Bootstrapping → Joining → Active → Wedging
//! → Draining → Installing → Active' → … → Leaving → Dead`.

mod restart;

pub use restart::{restart_rendezvous, RestartConfig, RestartOutcome};

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use sirocco_crypto::{SigningIdentity, VerifyingIdentity, SIGNATURE_LENGTH};
use sirocco_persist::VersionLog;
use sirocco_rbm::BlockTransport;
use sirocco_sst::{PredicateHandle, PredicateKind, RowFabric, Sst, SstRow};
use sirocco_types::{
    ChangeProposal, MemberAddress, NodeId, SubView, SubgroupId, Version, View, ViewId,
};
use tracing::{debug, error, info, warn};

use crate::callbacks::EngineCallbacks;
use crate::control::{ControlConnection, ControlFrame, ControlHandler, ControlServer, StateBlob};
use crate::engine::{now_ns, EngineConfig, MulticastEngine, PreservedState};
use crate::settings::{build_schema, build_settings, subgroup_column, SubgroupSettings};
use crate::GroupError;

/// Provisioner: maps a member roster to shard assignments, or reports
/// that the roster cannot host the layout yet.
pub type Provisioner = Arc<
    dyn Fn(&[NodeId]) -> Result<BTreeMap<SubgroupId, Vec<SubView>>, GroupError> + Send + Sync,
>;

/// Binder: attaches a freshly built table and engine endpoints to the
/// deployment's fabric/transport (in-process registries, TCP dispatch,
/// …). Called once per installed view.
pub type Binder =
    Arc<dyn Fn(&Arc<Sst>, &[Arc<sirocco_rbm::RbmGroup>]) + Send + Sync>;

/// Per-process protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Bootstrapping,
    Joining,
    Active,
    Wedging,
    Draining,
    Installing,
    Leaving,
    Dead,
}

/// View-manager construction parameters.
#[derive(Clone)]
pub struct VmConfig {
    pub my_node: NodeId,
    pub my_address: MemberAddress,
    pub heartbeat: Duration,
    /// Heartbeat stall beyond this suspects the peer.
    pub suspect_timeout: Duration,
    pub sender_timeout: Duration,
    pub disable_partitioning_safety: bool,
    pub persist_dir: PathBuf,
    pub persist_reset: bool,
    pub max_log_entry: u64,
    pub max_data_size: u64,
    pub signer: Option<Arc<SigningIdentity>>,
    pub peer_keys: BTreeMap<NodeId, VerifyingIdentity>,
    /// Bound on restart state-transfer retries.
    pub restart_timeout: Duration,
}

/// Row columns carried from one view's table into the next.
#[derive(Debug, Clone, Default)]
struct RowCarry {
    num_changes: i32,
    num_acked: i32,
    num_committed: i32,
    num_installed: i32,
    changes: Vec<ChangeProposal>,
    joiner_ips: Vec<u32>,
    joiner_gms_ports: Vec<u16>,
    joiner_state_transfer_ports: Vec<u16>,
    joiner_sst_ports: Vec<u16>,
    joiner_rdmc_ports: Vec<u16>,
    joiner_external_ports: Vec<u16>,
}

impl RowCarry {
    fn apply(&self, row: &mut SstRow) {
        row.num_changes = self.num_changes;
        row.num_acked = self.num_acked;
        row.num_committed = self.num_committed;
        row.num_installed = self.num_installed;
        row.changes = self.changes.clone();
        row.joiner_ips = self.joiner_ips.clone();
        row.joiner_gms_ports = self.joiner_gms_ports.clone();
        row.joiner_state_transfer_ports = self.joiner_state_transfer_ports.clone();
        row.joiner_sst_ports = self.joiner_sst_ports.clone();
        row.joiner_rdmc_ports = self.joiner_rdmc_ports.clone();
        row.joiner_external_ports = self.joiner_external_ports.clone();
    }

    fn level(installed: i32) -> Self {
        Self {
            num_changes: installed,
            num_acked: installed,
            num_committed: installed,
            num_installed: installed,
            ..Self::default()
        }
    }
}

struct VmState {
    status: VmStatus,
    view: Arc<View>,
    sst: Option<Arc<Sst>>,
    engine: Option<Arc<MulticastEngine>>,
    pred_handles: Vec<PredicateHandle>,
    /// Engine-layout settings for my shards in the current view.
    shard_info: BTreeMap<SubgroupId, SubgroupSettings>,
    /// Subgroups already drained in the current view change.
    drained: Vec<SubgroupId>,
    /// Count of changes being applied by the in-progress install.
    install_count: i32,
    /// Whether this node held leadership at last check (end-of-view
    /// marker bookkeeping).
    was_leader: bool,
    /// Joiners admitted by the in-progress view change, with addresses.
    pending_joins: Vec<(NodeId, MemberAddress)>,
    /// Leader only: set once the joiner-sync thread has handed the new
    /// view to every joiner.
    joiners_ready: bool,
    joiner_sync_running: bool,
}

pub(crate) struct VmShared {
    config: VmConfig,
    fabric: Arc<dyn RowFabric>,
    transport: Arc<dyn BlockTransport>,
    callbacks: EngineCallbacks,
    provisioner: Provisioner,
    binder: Binder,
    state: Mutex<VmState>,
    status_cv: Condvar,
    view_upcalls: Mutex<Vec<Box<dyn Fn(&View) + Send + Sync>>>,
    servers: Mutex<Vec<ControlServer>>,
}

/// See the module documentation.
pub struct ViewManager {
    shared: Arc<VmShared>,
}

impl ViewManager {
    /// Creates the manager and starts its control server on the GMS
    /// port of `config.my_address` (port 0 binds ephemerally; the bound
    /// address is readable via [`ViewManager::gms_addr`]).
    pub fn new(
        config: VmConfig,
        fabric: Arc<dyn RowFabric>,
        transport: Arc<dyn BlockTransport>,
        callbacks: EngineCallbacks,
        provisioner: Provisioner,
        binder: Binder,
    ) -> Result<Arc<Self>, GroupError> {
        let my_node = config.my_node;
        let placeholder = View::new(
            ViewId::ZERO,
            vec![my_node],
            vec![config.my_address],
            my_node,
        );
        let shared = Arc::new(VmShared {
            config,
            fabric,
            transport,
            callbacks,
            provisioner,
            binder,
            state: Mutex::new(VmState {
                status: VmStatus::Bootstrapping,
                view: Arc::new(placeholder),
                sst: None,
                engine: None,
                pred_handles: Vec::new(),
                shard_info: BTreeMap::new(),
                drained: Vec::new(),
                install_count: 0,
                was_leader: false,
                pending_joins: Vec::new(),
                joiners_ready: false,
                joiner_sync_running: false,
            }),
            status_cv: Condvar::new(),
            view_upcalls: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        let handler: ControlHandler = Arc::new(move |frame, conn| {
            match weak.upgrade() {
                Some(shared) => shared.handle_control(frame, conn),
                None => false,
            }
        });
        let ip = IpAddr::V4(shared.config.my_address.ip);
        let gms_server = ControlServer::start(
            SocketAddr::new(ip, shared.config.my_address.gms_port),
            handler.clone(),
        )?;
        let state_server = ControlServer::start(
            SocketAddr::new(ip, shared.config.my_address.state_transfer_port),
            handler,
        )?;
        // Ephemeral binds rewrite the advertised ports.
        let gms_port = gms_server.local_addr().port();
        let state_transfer_port = state_server.local_addr().port();
        *shared.servers.lock().expect("server slot poisoned") = vec![gms_server, state_server];
        {
            let mut state = shared.state.lock().expect("vm state poisoned");
            let mut view = (*state.view).clone();
            view.addresses[0].gms_port = gms_port;
            view.addresses[0].state_transfer_port = state_transfer_port;
            state.view = Arc::new(view);
        }

        Ok(Arc::new(Self { shared }))
    }

    /// The bound GMS control address.
    pub fn gms_addr(&self) -> SocketAddr {
        let state = self.shared.state.lock().expect("vm state poisoned");
        let addr = state.view.addresses[state.view.my_rank.as_usize()];
        SocketAddr::new(IpAddr::V4(addr.ip), addr.gms_port)
    }

    /// Registers a callback invoked with each installed view.
    pub fn register_view_upcall(&self, upcall: impl Fn(&View) + Send + Sync + 'static) {
        self.shared
            .view_upcalls
            .lock()
            .expect("upcalls poisoned")
            .push(Box::new(upcall));
    }

    /// Boots the group's first view with a simultaneous-start roster:
    /// every founding member calls this with the same member list.
    pub fn bootstrap(
        &self,
        members: Vec<(NodeId, MemberAddress)>,
    ) -> Result<(), GroupError> {
        let my_node = self.shared.config.my_node;
        if !members.iter().any(|(n, _)| *n == my_node) {
            return Err(GroupError::NotInLayout);
        }
        let (nodes, addresses): (Vec<NodeId>, Vec<MemberAddress>) =
            members.into_iter().unzip();
        let mut view = View::new(ViewId::ZERO, nodes, addresses, my_node);
        view.subgroup_shards = (self.shared.provisioner)(&view.members)?;
        VmShared::start_view(
            &self.shared,
            view,
            PreservedState::default(),
            RowCarry::default(),
        )
    }

    /// Boots from a restart rendezvous outcome (total-failure
    /// recovery): cuts the local logs back to the agreed recovery
    /// point, pulls any missing tail from each subgroup's shard leader,
    /// then installs the recovery view.
    pub fn bootstrap_restart(&self, outcome: RestartOutcome) -> Result<(), GroupError> {
        let mut view = outcome.view;
        view.subgroup_shards = (self.shared.provisioner)(&view.members)?;
        // Our own advertised ports may have been rewritten by ephemeral
        // binds after we reported them.
        let my_rank = view
            .rank_of(self.shared.config.my_node)
            .ok_or(GroupError::NotInLayout)?;
        view.my_rank = my_rank;
        view.addresses[my_rank.as_usize()] = self.my_advertised_address();

        let me = self.shared.config.my_node.as_u32();
        for (subgroup, _, _) in view.my_shards() {
            let sg = subgroup.as_u32();
            let recovery_point = Version::new(
                outcome.next_version.get(&sg).copied().unwrap_or(0) - 1,
            );
            {
                let mut log = VersionLog::open(
                    &self.shared.config.persist_dir,
                    subgroup,
                    false,
                    self.shared.config.max_log_entry,
                    self.shared.config.max_data_size,
                )?;
                log.truncate_to(recovery_point)?;
            }
            let Some(leader) = outcome.shard_leaders.get(&sg).copied() else { continue };
            if leader == me {
                continue;
            }
            let Some(rank) = view.rank_of(NodeId::new(leader)) else { continue };
            let address = view.addresses[rank.as_usize()];
            self.shared.fetch_log_tail(
                subgroup,
                address,
                self.shared.config.restart_timeout,
            )?;
        }

        let preserved = PreservedState {
            next_version: outcome
                .next_version
                .iter()
                .map(|(sg, v)| (SubgroupId::new(*sg), Version::new(*v)))
                .collect(),
            delivered_version: BTreeMap::new(),
        };
        VmShared::start_view(&self.shared, view, preserved, RowCarry::default())
    }

    /// Joins an existing group through its leader's GMS address.
    /// Blocks until the join completes (the first view including this
    /// node is installed) or fails.
    pub fn join(&self, contact: SocketAddr, timeout: Duration) -> Result<(), GroupError> {
        {
            let mut state = self.shared.state.lock().expect("vm state poisoned");
            state.status = VmStatus::Joining;
        }
        let mut conn = ControlConnection::connect(contact, timeout)?;
        conn.send(&ControlFrame::JoinRequest {
            node: self.shared.config.my_node.as_u32(),
            address: self.my_advertised_address(),
        })?;
        conn.set_read_timeout(Some(Duration::from_millis(200)))?;
        // The leader answers only to refuse; acceptance arrives as a
        // ViewBroadcast on our own control server.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match conn.recv() {
                Ok(ControlFrame::JoinRefused { reason, .. }) => {
                    return Err(GroupError::Control(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        reason,
                    )));
                }
                Ok(_) => {}
                Err(GroupError::Control(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => {
                    // Leader closed the handshake; installation signal
                    // arrives via our server.
                }
            }
            let state = self.shared.state.lock().expect("vm state poisoned");
            if state.status == VmStatus::Active {
                return Ok(());
            }
            if state.status == VmStatus::Dead {
                return Err(GroupError::Shutdown);
            }
            drop(state);
            if std::time::Instant::now() >= deadline {
                return Err(GroupError::Control(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "join did not complete before the timeout",
                )));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn my_advertised_address(&self) -> MemberAddress {
        let state = self.shared.state.lock().expect("vm state poisoned");
        state.view.addresses[state.view.my_rank.as_usize()]
    }

    /// The currently installed view.
    pub fn current_view(&self) -> Arc<View> {
        self.shared.state.lock().expect("vm state poisoned").view.clone()
    }

    pub fn status(&self) -> VmStatus {
        self.shared.state.lock().expect("vm state poisoned").status
    }

    /// The current view's engine, for sends and frontier queries.
    pub fn engine(&self) -> Result<Arc<MulticastEngine>, GroupError> {
        self.shared
            .state
            .lock()
            .expect("vm state poisoned")
            .engine
            .clone()
            .ok_or(GroupError::Shutdown)
    }

    /// Blocks until a view with id at least `vid` is installed, the
    /// process dies, or `timeout` elapses. Returns the view.
    pub fn wait_for_view(&self, vid: ViewId, timeout: Duration) -> Result<Arc<View>, GroupError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("vm state poisoned");
        loop {
            if state.status == VmStatus::Dead {
                return Err(GroupError::Shutdown);
            }
            if state.status == VmStatus::Active && state.view.vid >= vid {
                return Ok(state.view.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(GroupError::Control(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("view {vid} was not installed in time"),
                )));
            }
            let (next, _) = self
                .shared
                .status_cv
                .wait_timeout(state, deadline - now)
                .expect("vm state poisoned");
            state = next;
        }
    }

    /// Injects a failure report, as an application would on observing a
    /// peer misbehave. Escalates exactly like a detected failure.
    pub fn report_failure(&self, node: NodeId) {
        let rank = {
            let state = self.shared.state.lock().expect("vm state poisoned");
            state.view.rank_of(node).map(|r| r.as_usize())
        };
        if let Some(rank) = rank {
            self.shared.suspect(rank);
        }
    }

    /// Graceful departure: raises the exit flag and waits for the view
    /// change that removes this node, then shuts down.
    pub fn leave(&self, timeout: Duration) -> Result<(), GroupError> {
        {
            let mut state = self.shared.state.lock().expect("vm state poisoned");
            state.status = VmStatus::Leaving;
            if let Some(sst) = &state.sst {
                sst.write_local(|row| row.rip = true);
                let _ = sst.push_row_except_slots();
            }
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let state = self.shared.state.lock().expect("vm state poisoned");
                if state.status == VmStatus::Dead {
                    break;
                }
            }
            if std::time::Instant::now() >= deadline {
                warn!("departure was not installed before the timeout; shutting down anyway");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        self.shutdown();
        Ok(())
    }

    /// Hard stop: tears down engine, table, and control server.
    pub fn shutdown(&self) {
        let (engine, sst) = {
            let mut state = self.shared.state.lock().expect("vm state poisoned");
            state.status = VmStatus::Dead;
            (state.engine.take(), state.sst.take())
        };
        self.shared.status_cv.notify_all();
        if let Some(engine) = engine {
            engine.shutdown();
        }
        if let Some(sst) = sst {
            sst.shutdown();
        }
        for mut server in self.shared.servers.lock().expect("server slot poisoned").drain(..) {
            server.stop();
        }
    }
}

// ============================================================================
// Core protocol (predicate actions)
// ============================================================================

impl VmShared {
    /// Builds table and engine for `view` and activates it.
    fn start_view(
        shared: &Arc<Self>,
        mut view: View,
        preserved: PreservedState,
        carry: RowCarry,
    ) -> Result<(), GroupError> {
        view.failed = vec![false; view.members.len()];
        let signature_size = if shared.config.signer.is_some() {
            SIGNATURE_LENGTH
        } else {
            0
        };
        let schema = build_schema(&view, signature_size);
        let sst = Sst::new(
            schema,
            view.members.clone(),
            shared.config.my_node,
            shared.fabric.clone(),
            now_ns(),
        )?;
        sst.write_local(|row| {
            row.vid = view.vid;
            carry.apply(row);
        });
        let weak = Arc::downgrade(shared);
        sst.set_failure_handler(Box::new(move |rank| {
            if let Some(shared) = weak.upgrade() {
                shared.suspect(rank);
            }
        }));

        let engine = MulticastEngine::new(
            &view,
            sst.clone(),
            shared.transport.clone(),
            shared.callbacks.clone(),
            EngineConfig {
                vid: view.vid,
                sender_timeout: shared.config.sender_timeout,
                heartbeat: shared.config.heartbeat,
                rdmc_group_num_offset: (view.vid.as_i32() as u64) << 20,
                persist_dir: shared.config.persist_dir.clone(),
                persist_reset: shared.config.persist_reset && view.vid == ViewId::ZERO,
                max_log_entry: shared.config.max_log_entry,
                max_data_size: shared.config.max_data_size,
                signer: shared.config.signer.clone(),
                peer_keys: shared.config.peer_keys.clone(),
            },
            preserved,
        )?;
        (shared.binder)(&sst, &engine.rbm_groups());

        let handles = register_vm_predicates(shared, &sst);
        let shard_info = build_settings(&view);
        let was_leader = view.i_am_leader();
        let view = Arc::new(view);
        {
            let mut state = shared.state.lock().expect("vm state poisoned");
            state.view = view.clone();
            state.sst = Some(sst.clone());
            state.engine = Some(engine);
            state.pred_handles = handles;
            state.shard_info = shard_info;
            state.drained.clear();
            state.install_count = 0;
            state.was_leader = was_leader;
            state.pending_joins.clear();
            state.joiners_ready = false;
            state.joiner_sync_running = false;
            state.status = VmStatus::Active;
        }
        sst.push_row()?;
        shared.status_cv.notify_all();

        info!(
            vid = %view.vid,
            members = ?view.members.iter().map(|m| m.as_u32()).collect::<Vec<_>>(),
            joined = view.joined.len(),
            departed = view.departed.len(),
            "view installed"
        );
        for upcall in shared.view_upcalls.lock().expect("upcalls poisoned").iter() {
            upcall(&view);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Failure detection
    // ------------------------------------------------------------------------

    /// Marks `rank` suspected: publish the suspicion, freeze the row,
    /// and (on the leader) propose the departure.
    fn suspect(&self, rank: usize) {
        let Some(sst) = self.current_sst() else { return };
        if rank == sst.my_rank() {
            return;
        }
        let already = sst.read_local().suspected[rank];
        if !already {
            warn!(rank, peer = %sst.members()[rank], "peer suspected");
            sst.write_local(|row| row.suspected[rank] = true);
            sst.freeze(rank);
            let _ = sst.push_row_except_slots();
        }
        self.maybe_propose_departures();
    }

    /// One failure-watch pass: adopt peers' suspicions, time out stale
    /// heartbeats, and notice graceful exits.
    fn check_failures(&self) {
        let Some(sst) = self.current_sst() else { return };
        let my_rank = sst.my_rank();
        let now = now_ns();
        let timeout_ns = self.config.suspect_timeout.as_nanos() as u64;
        let n = sst.num_members();

        for rank in 0..n {
            if rank == my_rank || sst.is_frozen(rank) {
                continue;
            }
            let stale = {
                let row = sst.read(rank);
                let last_heard = row
                    .local_stability_frontier
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0);
                now.saturating_sub(last_heard) > timeout_ns
            };
            let suspected_elsewhere = sst.live_ranks().iter().any(|q| {
                *q != rank && sst.read(*q).suspected[rank]
            });
            if stale || suspected_elsewhere {
                self.suspect(rank);
            }
        }

        // Graceful departures: a peer with its exit flag raised wants a
        // view change that removes it, without being frozen out of the
        // drain.
        let rip_ranks: Vec<usize> = (0..n)
            .filter(|r| *r != my_rank && !sst.is_frozen(*r) && sst.read(*r).rip)
            .collect();
        if !rip_ranks.is_empty() {
            self.propose_ranks(&rip_ranks);
        }
    }

    // ------------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------------

    fn i_am_leader(&self, sst: &Sst) -> bool {
        let row = sst.read_local();
        (0..sst.num_members()).find(|r| !row.suspected[*r]) == Some(sst.my_rank())
    }

    /// Leader-side: propose departures for every suspected member not
    /// yet covered by a pending proposal.
    fn maybe_propose_departures(&self) {
        let Some(sst) = self.current_sst() else { return };
        let suspects: Vec<usize> = {
            let row = sst.read_local();
            (0..sst.num_members())
                .filter(|r| row.suspected[*r])
                .collect()
        };
        if !suspects.is_empty() {
            self.propose_ranks(&suspects);
        }
    }

    /// Leader-side: append departure proposals for `ranks`.
    fn propose_ranks(&self, ranks: &[usize]) {
        let Some(sst) = self.current_sst() else { return };
        if !self.i_am_leader(&sst) {
            return;
        }
        self.append_end_of_view_if_new_leader(&sst);

        let (view, my_id) = {
            let state = self.state.lock().expect("vm state poisoned");
            (state.view.clone(), self.config.my_node.as_u32() as u16)
        };
        let mut appended = false;
        sst.write_local(|row| {
            for rank in ranks {
                let Some(node) = view.members.get(*rank) else { continue };
                let id = node.as_u32() as u16;
                let covered = row
                    .changes
                    .iter()
                    .any(|c| !c.end_of_view && c.change_id == id);
                if covered || row.changes.len() >= sst.schema().max_changes() {
                    continue;
                }
                row.changes.push(ChangeProposal::new(my_id, id));
                push_joiner_placeholders(row);
                row.num_changes += 1;
                row.num_acked = row.num_changes;
                appended = true;
                debug!(node = id, "departure proposed");
            }
        });
        if appended {
            let _ = sst.push_row_except_slots();
        }
    }

    /// Leader-side: admit a joiner by proposal.
    fn propose_join(&self, node: NodeId, address: MemberAddress) -> bool {
        let Some(sst) = self.current_sst() else { return false };
        if !self.i_am_leader(&sst) {
            return false;
        }
        self.append_end_of_view_if_new_leader(&sst);
        let my_id = self.config.my_node.as_u32() as u16;
        let id = node.as_u32() as u16;
        let mut appended = false;
        sst.write_local(|row| {
            let covered = row
                .changes
                .iter()
                .any(|c| !c.end_of_view && c.change_id == id);
            if covered || row.changes.len() >= sst.schema().max_changes() {
                return;
            }
            row.changes.push(ChangeProposal::new(my_id, id));
            row.joiner_ips.push(u32::from(address.ip).to_be());
            row.joiner_gms_ports.push(address.gms_port);
            row.joiner_state_transfer_ports.push(address.state_transfer_port);
            row.joiner_sst_ports.push(address.sst_port);
            row.joiner_rdmc_ports.push(address.rbm_port);
            row.joiner_external_ports.push(address.external_port);
            row.num_changes += 1;
            row.num_acked = row.num_changes;
            appended = true;
        });
        if appended {
            info!(joiner = %node, "join proposed");
            let mut state = self.state.lock().expect("vm state poisoned");
            state.pending_joins.push((node, address));
            drop(state);
            let _ = sst.push_row_except_slots();
        }
        appended
    }

    /// On first acquiring leadership mid-view, delimit the previous
    /// regime's proposals.
    fn append_end_of_view_if_new_leader(&self, sst: &Sst) {
        let mut state = self.state.lock().expect("vm state poisoned");
        if state.was_leader {
            return;
        }
        state.was_leader = true;
        drop(state);
        let my_id = self.config.my_node.as_u32() as u16;
        sst.write_local(|row| {
            row.changes.push(ChangeProposal::end_of_view(my_id));
            push_joiner_placeholders(row);
            row.num_changes += 1;
            row.num_acked = row.num_changes;
        });
        debug!("end-of-view marker appended (leadership acquired)");
    }

    // ------------------------------------------------------------------------
    // Ack & commit
    // ------------------------------------------------------------------------

    /// Non-leaders mirror the leader's proposals and acknowledge them.
    fn ack_changes(&self) {
        let Some(sst) = self.current_sst() else { return };
        if self.i_am_leader(&sst) {
            return;
        }
        let leader_rank = {
            let row = sst.read_local();
            (0..sst.num_members()).find(|r| !row.suspected[*r])
        };
        let Some(leader_rank) = leader_rank else { return };
        if sst.is_frozen(leader_rank) {
            return;
        }
        let leader_snapshot = {
            let leader = sst.read(leader_rank);
            let mine = sst.read_local();
            if leader.num_changes <= mine.num_acked && leader.num_committed <= mine.num_committed
            {
                None
            } else {
                Some((
                    leader.num_changes,
                    leader.num_committed,
                    leader.changes.clone(),
                    leader.joiner_ips.clone(),
                    leader.joiner_gms_ports.clone(),
                    leader.joiner_state_transfer_ports.clone(),
                    leader.joiner_sst_ports.clone(),
                    leader.joiner_rdmc_ports.clone(),
                    leader.joiner_external_ports.clone(),
                ))
            }
        };
        let Some((
            num_changes,
            num_committed,
            changes,
            ips,
            gms,
            st,
            sstp,
            rbm,
            ext,
        )) = leader_snapshot
        else {
            return;
        };
        sst.write_local(|row| {
            row.changes = changes;
            row.joiner_ips = ips;
            row.joiner_gms_ports = gms;
            row.joiner_state_transfer_ports = st;
            row.joiner_sst_ports = sstp;
            row.joiner_rdmc_ports = rbm;
            row.joiner_external_ports = ext;
            row.num_changes = num_changes;
            row.num_acked = num_changes;
            if num_committed > row.num_committed {
                row.num_committed = num_committed;
            }
        });
        let _ = sst.push_row_except_slots();
    }

    /// Leader-side: commit once every live row has acknowledged.
    fn commit_changes(&self) {
        let Some(sst) = self.current_sst() else { return };
        if !self.i_am_leader(&sst) {
            return;
        }
        let min_acked = sst
            .live_ranks()
            .iter()
            .map(|r| sst.read(*r).num_acked)
            .min()
            .unwrap_or(0);
        let (num_changes, num_committed) = {
            let row = sst.read_local();
            (row.num_changes, row.num_committed)
        };
        let commit_to = min_acked.min(num_changes);
        if commit_to > num_committed {
            sst.write_local(|row| row.num_committed = commit_to);
            debug!(commit_to, "changes committed");
            let _ = sst.push_row_except_slots();
        }
    }

    // ------------------------------------------------------------------------
    // Wedge, drain, install
    // ------------------------------------------------------------------------

    /// Drives the view-change pipeline one step per pass.
    fn advance_view_change(self: &Arc<Self>) {
        let Some(sst) = self.current_sst() else { return };

        let status = self.state.lock().expect("vm state poisoned").status;
        match status {
            VmStatus::Active | VmStatus::Leaving => {
                let trigger = {
                    let row = sst.read_local();
                    row.num_committed > row.num_installed
                };
                if trigger {
                    let engine = {
                        let mut state = self.state.lock().expect("vm state poisoned");
                        state.status = VmStatus::Wedging;
                        state.engine.clone()
                    };
                    info!("view change triggered; wedging");
                    if let Some(engine) = engine {
                        engine.wedge();
                    }
                }
            }
            VmStatus::Wedging => {
                let all_wedged = sst
                    .live_ranks()
                    .iter()
                    .all(|r| sst.read(*r).wedged);
                if all_wedged {
                    {
                        let mut state = self.state.lock().expect("vm state poisoned");
                        state.status = VmStatus::Draining;
                    }
                    self.publish_global_min(&sst);
                }
            }
            VmStatus::Draining => {
                self.apply_ragged_trim(&sst);
                let done = {
                    let state = self.state.lock().expect("vm state poisoned");
                    state.drained.len() == state.shard_info.len()
                };
                if done {
                    let install_count = {
                        let row = sst.read_local();
                        row.num_committed - row.num_installed
                    };
                    sst.write_local(|row| row.num_installed = row.num_committed);
                    let _ = sst.push_row_except_slots();
                    let mut state = self.state.lock().expect("vm state poisoned");
                    state.install_count = install_count;
                    state.status = VmStatus::Installing;
                    debug!(install_count, "drain complete; installing");
                }
            }
            VmStatus::Installing => {
                // A change can commit while the install barrier forms
                // (a join admitted just before the wedge); fold it into
                // this install so the barrier can still level.
                let (committed_now, installed_now) = {
                    let row = sst.read_local();
                    (row.num_committed, row.num_installed)
                };
                if committed_now > installed_now {
                    sst.write_local(|row| row.num_installed = row.num_committed);
                    let _ = sst.push_row_except_slots();
                    let mut state = self.state.lock().expect("vm state poisoned");
                    state.install_count += committed_now - installed_now;
                }
                self.sync_joiners_if_leader(&sst);
                let committed = sst.read_local().num_committed;
                let all_installed = sst
                    .live_ranks()
                    .iter()
                    .all(|r| sst.read(*r).num_installed >= committed);
                let joiners_ok = {
                    let state = self.state.lock().expect("vm state poisoned");
                    state.pending_joins.is_empty()
                        || state.joiners_ready
                        || !self.i_am_leader_quiet(&sst)
                };
                if all_installed && joiners_ok {
                    if let Err(e) = self.do_install(&sst) {
                        error!(error = %e, "view install failed");
                        let mut state = self.state.lock().expect("vm state poisoned");
                        state.status = VmStatus::Dead;
                        drop(state);
                        self.status_cv.notify_all();
                    }
                }
            }
            VmStatus::Bootstrapping | VmStatus::Joining | VmStatus::Dead => {}
        }
    }

    fn i_am_leader_quiet(&self, sst: &Sst) -> bool {
        let row = sst.read_local();
        (0..sst.num_members()).find(|r| !row.suspected[*r]) == Some(sst.my_rank())
    }

    /// Shard leaders publish the agreed per-sender trim: the minimum
    /// receipt counter over the shard's live rows.
    fn publish_global_min(&self, sst: &Sst) {
        let shard_info = {
            let state = self.state.lock().expect("vm state poisoned");
            state.shard_info.clone()
        };
        let view = self.state.lock().expect("vm state poisoned").view.clone();
        let mut published = false;
        for (subgroup, s) in &shard_info {
            let Some(column) = subgroup_column(&view, *subgroup) else { continue };
            // Shard leader: the lowest-ranked live shard member.
            let shard_rows: Vec<usize> = s
                .members
                .iter()
                .filter_map(|m| view.rank_of(*m).map(|r| r.as_usize()))
                .collect();
            let leader_row = shard_rows.iter().copied().find(|r| !sst.is_frozen(*r));
            let my_row = sst.my_rank();
            if leader_row != Some(my_row) {
                continue;
            }
            let n = s.num_senders() as usize;
            let mut trim = vec![i32::MAX; n];
            for row_index in shard_rows.iter().filter(|r| !sst.is_frozen(**r)) {
                let row = sst.read(*row_index);
                for (j, t) in trim.iter_mut().enumerate() {
                    *t = (*t).min(row.num_received[s.num_received_offset + j]);
                }
            }
            sst.write_local(|row| {
                for (j, t) in trim.iter().enumerate() {
                    row.global_min[s.num_received_offset + j] = *t;
                }
                row.global_min_ready[column] = true;
            });
            debug!(%subgroup, ?trim, "trim frontier published");
            published = true;
        }
        if published {
            let _ = sst.push_row_except_slots();
        }
    }

    /// Members deliver exactly to each shard leader's published trim.
    fn apply_ragged_trim(&self, sst: &Sst) {
        let (shard_info, view, engine) = {
            let state = self.state.lock().expect("vm state poisoned");
            (
                state.shard_info.clone(),
                state.view.clone(),
                state.engine.clone(),
            )
        };
        let Some(engine) = engine else { return };
        for (subgroup, s) in &shard_info {
            {
                let state = self.state.lock().expect("vm state poisoned");
                if state.drained.contains(subgroup) {
                    continue;
                }
            }
            let Some(column) = subgroup_column(&view, *subgroup) else { continue };
            let shard_rows: Vec<usize> = s
                .members
                .iter()
                .filter_map(|m| view.rank_of(*m).map(|r| r.as_usize()))
                .collect();
            let Some(leader_row) = shard_rows.iter().copied().find(|r| !sst.is_frozen(*r))
            else {
                continue;
            };
            let trim: Option<Vec<i32>> = {
                let row = sst.read(leader_row);
                row.global_min_ready[column].then(|| {
                    (0..s.num_senders() as usize)
                        .map(|j| row.global_min[s.num_received_offset + j])
                        .collect()
                })
            };
            let Some(trim) = trim else { continue };
            engine.deliver_messages_upto(&trim, *subgroup);
            let mut state = self.state.lock().expect("vm state poisoned");
            state.drained.push(*subgroup);
            debug!(%subgroup, ?trim, "ragged trim applied");
        }
    }

    /// Leader-side: hand the upcoming view to every admitted joiner
    /// before completing the install barrier. Runs the blocking TCP
    /// work on a one-shot helper thread.
    fn sync_joiners_if_leader(self: &Arc<Self>, sst: &Sst) {
        if !self.i_am_leader_quiet(sst) {
            return;
        }
        let should_spawn = {
            let mut state = self.state.lock().expect("vm state poisoned");
            if state.pending_joins.is_empty()
                || state.joiners_ready
                || state.joiner_sync_running
            {
                false
            } else {
                state.joiner_sync_running = true;
                true
            }
        };
        if !should_spawn {
            return;
        }
        let shared = self.clone();
        let _ = std::thread::Builder::new()
            .name("joiner-sync".to_string())
            .spawn(move || {
                let outcome = shared.run_joiner_sync();
                let mut state = shared.state.lock().expect("vm state poisoned");
                state.joiner_sync_running = false;
                state.joiners_ready = outcome;
            });
    }

    /// Sends the computed next view to each joiner and waits for its
    /// acknowledgment (it acknowledges only after completing state
    /// transfer and standing up its table).
    fn run_joiner_sync(&self) -> bool {
        let Some((next_view, next_version, installed, joiners)) =
            self.compute_next_view_for_joiners()
        else {
            return false;
        };
        for (node, address) in joiners {
            let addr = SocketAddr::new(IpAddr::V4(address.ip), address.gms_port);
            let attempt = (|| -> Result<(), GroupError> {
                let mut conn = ControlConnection::connect(addr, Duration::from_secs(5))?;
                conn.send(&ControlFrame::ViewBroadcast {
                    view: next_view.clone(),
                    next_version: next_version.clone(),
                    installed,
                })?;
                conn.set_read_timeout(Some(Duration::from_secs(30)))?;
                loop {
                    match conn.recv()? {
                        ControlFrame::JoinAck { .. } => return Ok(()),
                        ControlFrame::JoinRefused { reason, .. } => {
                            return Err(GroupError::Control(std::io::Error::new(
                                std::io::ErrorKind::ConnectionRefused,
                                reason,
                            )));
                        }
                        _ => continue,
                    }
                }
            })();
            if let Err(e) = attempt {
                warn!(joiner = %node, error = %e, "joiner hand-off failed; dropping the join");
                // The joiner will be absent from the next view's live
                // traffic and time out like any failed member.
            }
        }
        true
    }

    /// The next view as install will compute it, for handing to
    /// joiners ahead of the switch.
    fn compute_next_view_for_joiners(
        &self,
    ) -> Option<(View, BTreeMap<u32, i64>, i32, Vec<(NodeId, MemberAddress)>)> {
        let sst = self.current_sst()?;
        let state = self.state.lock().expect("vm state poisoned");
        let install_count = state.install_count;
        let view = state.view.clone();
        let joiners = state.pending_joins.clone();
        let engine = state.engine.clone()?;
        drop(state);
        let row = sst.read_local().clone();
        let mut next = compute_next_view(
            &view,
            &row,
            install_count as usize,
            self.config.my_node,
        );
        next.subgroup_shards = (self.provisioner)(&next.members).ok()?;
        let preserved = engine.preserved_state();
        let next_version = preserved
            .next_version
            .iter()
            .map(|(sg, v)| (sg.as_u32(), v.as_i64()))
            .collect();
        Some((next, next_version, row.num_committed, joiners))
    }

    /// The final step: construct the next view, rebuild the engine, and
    /// resume.
    fn do_install(self: &Arc<Self>, sst: &Sst) -> Result<(), GroupError> {
        let (view, install_count) = {
            let state = self.state.lock().expect("vm state poisoned");
            (state.view.clone(), state.install_count as usize)
        };
        let row = sst.read_local().clone();
        let mut next = compute_next_view(&view, &row, install_count, self.config.my_node);

        // Partitioning safety: the successor must retain a majority of
        // the current membership.
        let surviving = view
            .members
            .iter()
            .filter(|m| next.members.contains(m))
            .count();
        if !self.config.disable_partitioning_safety
            && !view.is_adequate_successor(surviving)
        {
            return Err(GroupError::PartitioningUnsafe {
                vid: next.vid.as_i32(),
                surviving,
                previous: view.num_members(),
            });
        }

        // Departure of the local node ends its life in the group.
        if !next.members.contains(&self.config.my_node) {
            info!("local node departed in the next view; going quiet");
            let mut state = self.state.lock().expect("vm state poisoned");
            state.status = VmStatus::Dead;
            drop(state);
            self.status_cv.notify_all();
            return Ok(());
        }

        next.subgroup_shards = match (self.provisioner)(&next.members) {
            Ok(shards) => shards,
            Err(GroupError::NotProvisioned { subgroup }) => {
                // Recoverable: stay wedged and wait for more members.
                warn!(%subgroup, "next view is not adequately provisioned; waiting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let (engine, old_sst) = {
            let mut state = self.state.lock().expect("vm state poisoned");
            (state.engine.take(), state.sst.take())
        };
        let preserved = engine
            .as_ref()
            .map(|e| e.preserved_state())
            .unwrap_or_default();
        if let Some(engine) = engine {
            engine.shutdown();
        }
        if let Some(old) = old_sst {
            for handle in self.state.lock().expect("vm state poisoned").pred_handles.drain(..) {
                old.remove_predicate(handle);
            }
            old.shutdown();
        }

        let carry = RowCarry {
            num_changes: row.num_changes,
            num_acked: row.num_acked,
            num_committed: row.num_committed,
            num_installed: row.num_installed,
            changes: row.changes.get(install_count..).unwrap_or(&[]).to_vec(),
            joiner_ips: row.joiner_ips.get(install_count..).unwrap_or(&[]).to_vec(),
            joiner_gms_ports: row.joiner_gms_ports.get(install_count..).unwrap_or(&[]).to_vec(),
            joiner_state_transfer_ports: row
                .joiner_state_transfer_ports
                .get(install_count..)
                .unwrap_or(&[])
                .to_vec(),
            joiner_sst_ports: row.joiner_sst_ports.get(install_count..).unwrap_or(&[]).to_vec(),
            joiner_rdmc_ports: row.joiner_rdmc_ports.get(install_count..).unwrap_or(&[]).to_vec(),
            joiner_external_ports: row
                .joiner_external_ports
                .get(install_count..)
                .unwrap_or(&[])
                .to_vec(),
        };
        Self::start_view(self, next, preserved, carry)
    }

    // ------------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------------

    fn handle_control(self: &Arc<Self>, frame: ControlFrame, conn: &mut ControlConnection) -> bool {
        match frame {
            ControlFrame::JoinRequest { node, address } => {
                let accepted = {
                    let status = self.state.lock().expect("vm state poisoned").status;
                    status == VmStatus::Active && self.propose_join(NodeId::new(node), address)
                };
                if !accepted {
                    let leader_hint = {
                        let state = self.state.lock().expect("vm state poisoned");
                        state
                            .view
                            .leader_rank()
                            .map(|r| state.view.addresses[r.as_usize()])
                    };
                    let _ = conn.send(&ControlFrame::JoinRefused {
                        reason: "not the leader, or not accepting joins".to_string(),
                        leader_hint,
                    });
                }
                false
            }
            ControlFrame::LeaveNotify { node } => {
                let rank = {
                    let state = self.state.lock().expect("vm state poisoned");
                    state.view.rank_of(NodeId::new(node)).map(|r| r.as_usize())
                };
                if let Some(rank) = rank {
                    self.propose_ranks(&[rank]);
                }
                false
            }
            ControlFrame::ViewBroadcast {
                view,
                next_version,
                installed,
            } => {
                let joining = {
                    let state = self.state.lock().expect("vm state poisoned");
                    state.status == VmStatus::Joining
                };
                if joining {
                    match self.complete_join(view, next_version, installed) {
                        Ok(()) => {
                            let _ = conn.send(&ControlFrame::JoinAck {
                                node: self.config.my_node.as_u32(),
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to take over broadcast view");
                            let mut state = self.state.lock().expect("vm state poisoned");
                            state.status = VmStatus::Dead;
                        }
                    }
                }
                false
            }
            ControlFrame::StateRequest {
                subgroup,
                from_version,
            } => {
                match self.read_state_blob(SubgroupId::new(subgroup), Version::new(from_version)) {
                    Ok(blob) => {
                        let _ = conn.send(&ControlFrame::StateBlobFrame(blob));
                    }
                    Err(e) => {
                        warn!(subgroup, error = %e, "state transfer request failed");
                    }
                }
                true
            }
            ControlFrame::RestartReport { .. } | ControlFrame::RestartView { .. } => {
                // Restart frames are consumed by the rendezvous routine,
                // which runs its own server before the manager starts.
                false
            }
            ControlFrame::JoinRefused { .. }
            | ControlFrame::JoinAck { .. }
            | ControlFrame::StateBlobFrame(_) => false,
        }
    }

    /// Joiner-side completion: fetch shard state, stand up the view,
    /// then acknowledge so the leader can finish installing.
    fn complete_join(
        self: &Arc<Self>,
        view: View,
        next_version: BTreeMap<u32, i64>,
        installed: i32,
    ) -> Result<(), GroupError> {
        info!(vid = %view.vid, "received first view; transferring state");
        self.transfer_state_from_shard_leaders(&view)?;
        let carry = RowCarry::level(installed);
        let preserved = PreservedState {
            next_version: next_version
                .iter()
                .map(|(sg, v)| (SubgroupId::new(*sg), Version::new(*v)))
                .collect(),
            delivered_version: BTreeMap::new(),
        };
        Self::start_view(self, view, preserved, carry)
    }

    /// Pulls the version-log tail for each of our subgroups from its
    /// shard leader, before any delivery in the new view can fire.
    fn transfer_state_from_shard_leaders(&self, view: &View) -> Result<(), GroupError> {
        let me = self.config.my_node;
        for (subgroup, _, shard) in view.my_shards() {
            // Donor: the first shard member that predates this view.
            let donor = shard
                .members
                .iter()
                .find(|m| **m != me && !view.joined.contains(m))
                .copied();
            let Some(donor) = donor else { continue };
            let Some(rank) = view.rank_of(donor) else { continue };
            let address = view.addresses[rank.as_usize()];
            let addr = SocketAddr::new(IpAddr::V4(address.ip), address.state_transfer_port);

            let local_last = {
                let log = VersionLog::open(
                    &self.config.persist_dir,
                    subgroup,
                    false,
                    self.config.max_log_entry,
                    self.config.max_data_size,
                )?;
                log.last_version()
            };

            let mut conn = ControlConnection::connect(addr, Duration::from_secs(5))?;
            conn.send(&ControlFrame::StateRequest {
                subgroup: subgroup.as_u32(),
                from_version: local_last.as_i64(),
            })?;
            conn.set_read_timeout(Some(Duration::from_secs(30)))?;
            let blob = loop {
                match conn.recv()? {
                    ControlFrame::StateBlobFrame(blob) => break blob,
                    _ => continue,
                }
            };
            self.apply_state_blob(subgroup, &blob)?;
            info!(%subgroup, upto = blob.version, "shard state transferred");
        }
        Ok(())
    }

    fn apply_state_blob(&self, subgroup: SubgroupId, blob: &StateBlob) -> Result<(), GroupError> {
        use bytes::Bytes;
        let mut log = VersionLog::open(
            &self.config.persist_dir,
            subgroup,
            false,
            self.config.max_log_entry,
            self.config.max_data_size,
        )?;
        let data = Bytes::from(blob.blob.clone());
        let mut offset = 0usize;
        while offset < data.len() {
            let rest = data.slice(offset..);
            match sirocco_persist::LogEntry::decode(&rest, offset as u64)? {
                Some((entry, consumed)) => {
                    if entry.version > log.last_version() {
                        log.append(&entry)?;
                    }
                    offset += consumed;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Pulls the log tail above our durable frontier from `address`'s
    /// state-transfer port, retrying while the donor's server comes up.
    fn fetch_log_tail(
        &self,
        subgroup: SubgroupId,
        address: MemberAddress,
        timeout: Duration,
    ) -> Result<(), GroupError> {
        let addr = SocketAddr::new(IpAddr::V4(address.ip), address.state_transfer_port);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let attempt = (|| -> Result<(), GroupError> {
                let local_last = {
                    let log = VersionLog::open(
                        &self.config.persist_dir,
                        subgroup,
                        false,
                        self.config.max_log_entry,
                        self.config.max_data_size,
                    )?;
                    log.last_version()
                };
                let mut conn = ControlConnection::connect(addr, Duration::from_millis(500))?;
                conn.send(&ControlFrame::StateRequest {
                    subgroup: subgroup.as_u32(),
                    from_version: local_last.as_i64(),
                })?;
                conn.set_read_timeout(Some(Duration::from_secs(30)))?;
                loop {
                    match conn.recv()? {
                        ControlFrame::StateBlobFrame(blob) => {
                            self.apply_state_blob(subgroup, &blob)?;
                            return Ok(());
                        }
                        _ => continue,
                    }
                }
            })();
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if std::time::Instant::now() < deadline => {
                    debug!(%subgroup, error = %e, "log tail fetch retrying");
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_state_blob(
        &self,
        subgroup: SubgroupId,
        from_version: Version,
    ) -> Result<StateBlob, GroupError> {
        let mut log = VersionLog::open(
            &self.config.persist_dir,
            subgroup,
            false,
            self.config.max_log_entry,
            self.config.max_data_size,
        )?;
        let entries = log.read_since(from_version)?;
        let version = entries
            .last()
            .map(|e| e.version.as_i64())
            .unwrap_or(from_version.as_i64());
        let mut blob = Vec::new();
        for entry in &entries {
            blob.extend_from_slice(&entry.encode());
        }
        Ok(StateBlob {
            subgroup: subgroup.as_u32(),
            version,
            blob,
        })
    }

    fn current_sst(&self) -> Option<Arc<Sst>> {
        self.state.lock().expect("vm state poisoned").sst.clone()
    }
}

/// Join proposals keep the joiner arrays aligned with `changes`;
/// non-join entries carry zero placeholders.
fn push_joiner_placeholders(row: &mut SstRow) {
    row.joiner_ips.push(0);
    row.joiner_gms_ports.push(0);
    row.joiner_state_transfer_ports.push(0);
    row.joiner_sst_ports.push(0);
    row.joiner_rdmc_ports.push(0);
    row.joiner_external_ports.push(0);
}

/// Applies the first `install_count` committed proposals to `view`,
/// producing the successor roster deterministically: departures remove,
/// joins append in proposal order.
fn compute_next_view(view: &View, row: &SstRow, install_count: usize, my_node: NodeId) -> View {
    let mut members = view.members.clone();
    let mut addresses = view.addresses.clone();
    let mut joined = Vec::new();
    let mut departed = Vec::new();

    for (i, proposal) in row.changes.iter().take(install_count).enumerate() {
        if proposal.end_of_view {
            continue;
        }
        let node = proposal.node();
        if let Some(pos) = members.iter().position(|m| *m == node) {
            departed.push(node);
            members.remove(pos);
            addresses.remove(pos);
        } else {
            joined.push(node);
            members.push(node);
            addresses.push(MemberAddress {
                ip: std::net::Ipv4Addr::from(u32::from_be(row.joiner_ips[i])),
                gms_port: row.joiner_gms_ports[i],
                state_transfer_port: row.joiner_state_transfer_ports[i],
                sst_port: row.joiner_sst_ports[i],
                rbm_port: row.joiner_rdmc_ports[i],
                external_port: row.joiner_external_ports[i],
            });
        }
    }

    let mut next = View::new(view.vid.next(), members, addresses, my_node);
    next.joined = joined;
    next.departed = departed;
    next
}

// ============================================================================
// Predicate registration
// ============================================================================

fn register_vm_predicates(shared: &Arc<VmShared>, sst: &Arc<Sst>) -> Vec<PredicateHandle> {
    let mut handles = Vec::new();

    let weak: Weak<VmShared> = Arc::downgrade(shared);
    handles.push(sst.register_predicate(
        "vm_failure_watch",
        |_| true,
        move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.check_failures();
            }
        },
        PredicateKind::Recurrent,
    ));

    let weak: Weak<VmShared> = Arc::downgrade(shared);
    handles.push(sst.register_predicate(
        "vm_membership",
        |_| true,
        move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.ack_changes();
                shared.commit_changes();
                shared.advance_view_change();
            }
        },
        PredicateKind::Recurrent,
    ));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use sirocco_types::DeliveryMode;

    fn view_of(ids: &[u32], me: u32) -> View {
        let members: Vec<NodeId> = ids.iter().copied().map(NodeId::new).collect();
        let addresses = ids
            .iter()
            .map(|i| MemberAddress::localhost(30_000 + (*i as u16) * 10))
            .collect();
        View::new(ViewId::new(4), members, addresses, NodeId::new(me))
    }

    fn row_for(view: &View) -> SstRow {
        let schema = build_schema(view, 0);
        schema.new_row(0)
    }

    #[test]
    fn departure_shrinks_the_roster() {
        let view = view_of(&[1, 2, 3], 1);
        let mut row = row_for(&view);
        row.changes.push(ChangeProposal::new(1, 2));
        push_joiner_placeholders(&mut row);

        let next = compute_next_view(&view, &row, 1, NodeId::new(1));
        assert_eq!(next.vid, ViewId::new(5));
        assert_eq!(
            next.members,
            vec![NodeId::new(1), NodeId::new(3)]
        );
        assert_eq!(next.departed, vec![NodeId::new(2)]);
        assert!(next.joined.is_empty());
    }

    #[test]
    fn join_appends_to_the_roster() {
        let view = view_of(&[1, 2], 2);
        let mut row = row_for(&view);
        row.changes.push(ChangeProposal::new(1, 7));
        row.joiner_ips.push(u32::from(std::net::Ipv4Addr::LOCALHOST).to_be());
        row.joiner_gms_ports.push(31_000);
        row.joiner_state_transfer_ports.push(31_001);
        row.joiner_sst_ports.push(31_002);
        row.joiner_rdmc_ports.push(31_003);
        row.joiner_external_ports.push(31_004);

        let next = compute_next_view(&view, &row, 1, NodeId::new(2));
        assert_eq!(
            next.members,
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(7)]
        );
        assert_eq!(next.joined, vec![NodeId::new(7)]);
        assert_eq!(next.addresses[2].gms_port, 31_000);
        assert_eq!(next.my_rank.as_u32(), 1);
    }

    #[test]
    fn end_of_view_markers_are_skipped() {
        let view = view_of(&[1, 2, 3], 3);
        let mut row = row_for(&view);
        row.changes.push(ChangeProposal::end_of_view(2));
        push_joiner_placeholders(&mut row);
        row.changes.push(ChangeProposal::new(2, 1));
        push_joiner_placeholders(&mut row);

        let next = compute_next_view(&view, &row, 2, NodeId::new(3));
        assert_eq!(next.members, vec![NodeId::new(2), NodeId::new(3)]);
        assert_eq!(next.departed, vec![NodeId::new(1)]);
    }

    #[test]
    fn uninstalled_tail_is_ignored() {
        let view = view_of(&[1, 2, 3], 1);
        let mut row = row_for(&view);
        row.changes.push(ChangeProposal::new(1, 3));
        push_joiner_placeholders(&mut row);
        row.changes.push(ChangeProposal::new(1, 2));
        push_joiner_placeholders(&mut row);

        // Only the first proposal is committed for this install.
        let next = compute_next_view(&view, &row, 1, NodeId::new(1));
        assert_eq!(next.members, vec![NodeId::new(1), NodeId::new(2)]);
    }

    #[test]
    fn subview_sender_restriction_survives_provisioning_shape() {
        // Sanity that the provisioner contract composes with SubView.
        let shard = SubView::new(
            DeliveryMode::Ordered,
            vec![NodeId::new(1), NodeId::new(2)],
            Default::default(),
        )
        .with_senders(&[NodeId::new(2)]);
        assert_eq!(shard.num_senders(), 1);
        assert_eq!(shard.sender_rank_of(1), Some(0));
    }
}
