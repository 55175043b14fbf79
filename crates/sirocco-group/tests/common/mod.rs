//! In-process multi-node test harness.
//!
//! Every "node" is a full [`Group`] stack; table, engine, view
//! manager, control servers; wired over the in-process row fabric and
//! block transport, with its own persistence directory. Control
//! channels use real TCP on ephemeral loopback ports.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sirocco_config::{
    CoreConfig, Layout, LoggerConfig, PersConfig, SiroccoConfig, SubgroupProfileConfig,
};
use sirocco_group::{Group, GroupBuilder, TypeTag, UserCallbacks};
use sirocco_rbm::LoopbackTransport;
use sirocco_sst::MemoryFabric;
use sirocco_types::{MemberAddress, NodeId};
use tempfile::TempDir;

/// One delivered message, as observed by the stability callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subgroup: u32,
    pub sender: u32,
    pub index: i32,
    pub payload: Vec<u8>,
    pub version: i64,
}

pub struct TestNode {
    pub id: u32,
    pub group: Group,
    pub delivered: Arc<Mutex<Vec<Delivery>>>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn deliveries_from(&self, sender: u32) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.sender == sender)
            .collect()
    }

    pub fn gms_addr(&self) -> SocketAddr {
        self.group.view_manager().gms_addr()
    }

    pub fn address(&self) -> MemberAddress {
        let view = self.group.current_view();
        view.addresses[view.my_rank.as_usize()]
    }
}

pub struct Cluster {
    pub fabric: Arc<MemoryFabric>,
    pub transport: Arc<LoopbackTransport>,
    pub nodes: Vec<TestNode>,
}

pub const CACHE: TypeTag = TypeTag(0);

pub fn small_profile() -> SubgroupProfileConfig {
    SubgroupProfileConfig {
        max_payload_size: 4_096,
        max_reply_payload_size: 4_096,
        max_smc_payload_size: 2_048,
        block_size: 1_024,
        window_size: 8,
        rdmc_send_algorithm: sirocco_types::SendAlgorithm::Binomial,
    }
}

pub fn node_config(
    id: u32,
    layout_json: &str,
    profile: &SubgroupProfileConfig,
    reset: bool,
) -> SiroccoConfig {
    let mut core = CoreConfig::default();
    core.local_id = id;
    core.local_ip = "127.0.0.1".to_string();
    core.gms_port = 0;
    core.state_transfer_port = 0;
    core.heartbeat_ms = 20;
    core.sst_poll_cq_timeout_ms = 3_000;
    core.restart_timeout_ms = 10_000;
    SiroccoConfig {
        core,
        profiles: BTreeMap::new(),
        default_profile: Some(profile.clone()),
        layout: Layout::from_json(layout_json).expect("test layout parses"),
        pers: PersConfig {
            reset,
            ..PersConfig::default()
        },
        logger: LoggerConfig {
            default_log_level: "warn".to_string(),
            ..LoggerConfig::default()
        },
    }
}

impl Cluster {
    /// Builds node stacks for `ids` over shared in-process plumbing.
    /// Nothing is started; call [`Cluster::found`] or join.
    pub fn launch(ids: &[u32], layout_json: &str, profile: &SubgroupProfileConfig) -> Cluster {
        let fabric = MemoryFabric::new();
        let transport = LoopbackTransport::new();
        let nodes = ids
            .iter()
            .map(|id| build_node(*id, layout_json, profile, &fabric, &transport, true, None))
            .collect();
        Cluster {
            fabric,
            transport,
            nodes,
        }
    }

    /// Founds the group simultaneously across all launched nodes.
    pub fn found(&self) {
        let roster: Vec<(NodeId, MemberAddress)> = self
            .nodes
            .iter()
            .map(|n| (NodeId::new(n.id), n.address()))
            .collect();
        std::thread::scope(|scope| {
            for node in &self.nodes {
                let roster = roster.clone();
                scope.spawn(move || {
                    node.group
                        .start_founding(roster)
                        .expect("founding succeeds");
                });
            }
        });
    }

    pub fn node(&self, id: u32) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .expect("node id exists")
    }

    /// Simulates a crash: unreachable on both planes, then local
    /// teardown.
    pub fn crash(&self, id: u32) {
        self.fabric.cut(NodeId::new(id));
        self.transport.cut(NodeId::new(id));
        self.node(id).group.shutdown();
    }

    /// Adds a node stack sharing this cluster's plumbing (for joins).
    pub fn add_node(&mut self, id: u32, layout_json: &str, profile: &SubgroupProfileConfig) {
        let node = build_node(
            id,
            layout_json,
            profile,
            &self.fabric,
            &self.transport,
            true,
            None,
        );
        self.nodes.push(node);
    }
}

pub fn build_node(
    id: u32,
    layout_json: &str,
    profile: &SubgroupProfileConfig,
    fabric: &Arc<MemoryFabric>,
    transport: &Arc<LoopbackTransport>,
    reset: bool,
    reuse_dir: Option<TempDir>,
) -> TestNode {
    let dir = reuse_dir.unwrap_or_else(|| tempfile::tempdir().expect("tempdir"));
    let delivered: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let callbacks = UserCallbacks {
        stability: Some(Arc::new(move |subgroup, sender, index, payload, version| {
            sink.lock().unwrap().push(Delivery {
                subgroup: subgroup.as_u32(),
                sender: sender.as_u32(),
                index,
                payload: payload.map(|b| b.to_vec()).unwrap_or_default(),
                version: version.as_i64(),
            });
        })),
        ..UserCallbacks::default()
    };
    let group = GroupBuilder::new(node_config(id, layout_json, profile, reset))
        .callbacks(callbacks)
        .register_type(CACHE, "cache", Box::new(|_| Box::new(())))
        .in_process(fabric.clone(), transport.clone(), NodeId::new(id))
        .persist_dir(dir.path())
        .build()
        .expect("group builds");
    TestNode {
        id,
        group,
        delivered,
        dir,
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Sends `payload` on `handle`, retrying while the window is full or a
/// view change is in flight.
pub fn send_until_accepted(
    handle: &sirocco_group::SubgroupHandle,
    payload: &[u8],
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match handle.ordered_send(payload) {
            Ok(true) => return true,
            Ok(false) => {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}
