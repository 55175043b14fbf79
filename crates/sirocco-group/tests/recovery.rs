//! Recovery after total failure: every member goes down, comes back,
//! and the group resumes from the durable logs at the agreed point.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{build_node, send_until_accepted, small_profile, wait_until, Cluster, CACHE};
use sirocco_group::RestartOutcome;
use sirocco_persist::{RestartMeta, VersionLog};
use sirocco_types::{MemberAddress, NodeId, SubgroupId, View, ViewId};

const TWO_MEMBER_LAYOUT: &str =
    r#"[ { "name": "cache", "shards": [ { "members": [1, 2] } ] } ]"#;

#[test]
fn restart_resumes_versions_from_durable_logs() {
    // First life: two members, some durable traffic, then everyone
    // goes down.
    let mut cluster = Cluster::launch(&[1, 2], TWO_MEMBER_LAYOUT, &small_profile());
    cluster.found();

    const COUNT: usize = 30;
    {
        let handle = cluster.node(1).group.get_subgroup(CACHE, 0).unwrap();
        for i in 0..COUNT as u8 {
            assert!(send_until_accepted(&handle, &[i; 128], Duration::from_secs(30)));
        }
    }
    assert!(wait_until(Duration::from_secs(30), || {
        cluster.nodes.iter().all(|n| {
            n.group
                .get_subgroup(CACHE, 0)
                .and_then(|h| h.get_global_persistence_frontier())
                .map(|v| v.as_i64() >= (COUNT as i64 - 1))
                .unwrap_or(false)
        })
    }));

    for node in &cluster.nodes {
        node.group.shutdown();
    }

    // Inspect the durable state the nodes left behind.
    let mut durable = BTreeMap::new();
    let mut dirs = Vec::new();
    for node in cluster.nodes.drain(..) {
        let last = VersionLog::open(node.dir.path(), SubgroupId::new(0), false, 1 << 20, 1 << 30)
            .unwrap()
            .last_version();
        assert!(last.as_i64() >= COUNT as i64 - 1, "node {} lost data", node.id);
        let meta = RestartMeta::load(node.dir.path()).unwrap();
        assert_eq!(meta.last_vid, Some(ViewId::ZERO));
        assert_eq!(meta.last_members, vec![1, 2]);
        durable.insert(node.id, last);
        dirs.push((node.id, node.dir));
    }

    // Second life: fresh stacks over the surviving directories. The
    // rendezvous decision is driven directly, as a single-host rig
    // does.
    let fabric = sirocco_sst::MemoryFabric::new();
    let transport = sirocco_rbm::LoopbackTransport::new();
    let nodes: Vec<_> = dirs
        .into_iter()
        .map(|(id, dir)| {
            build_node(
                id,
                TWO_MEMBER_LAYOUT,
                &small_profile(),
                &fabric,
                &transport,
                false,
                Some(dir),
            )
        })
        .collect();

    let recovery_level = durable.values().map(|v| v.as_i64()).max().unwrap();
    let shard_leader = durable
        .iter()
        .max_by_key(|(id, v)| (v.as_i64(), std::cmp::Reverse(**id)))
        .map(|(id, _)| *id)
        .unwrap();
    let make_outcome = |me: u32| {
        let members: Vec<NodeId> = nodes.iter().map(|n| NodeId::new(n.id)).collect();
        let addresses: Vec<MemberAddress> = nodes.iter().map(|n| n.address()).collect();
        let view = View::new(ViewId::new(1), members, addresses, NodeId::new(me));
        RestartOutcome {
            view,
            shard_leaders: BTreeMap::from([(0, shard_leader)]),
            next_version: BTreeMap::from([(0, recovery_level + 1)]),
        }
    };

    std::thread::scope(|scope| {
        for node in &nodes {
            let outcome = make_outcome(node.id);
            scope.spawn(move || {
                node.group
                    .restart_with(outcome)
                    .expect("restart bootstraps");
            });
        }
    });

    // The recovered view is live and version numbering continues where
    // the durable history ended.
    let handle = nodes[0].group.get_subgroup(CACHE, 0).unwrap();
    assert!(send_until_accepted(&handle, b"after restart", Duration::from_secs(30)));
    assert!(wait_until(Duration::from_secs(30), || {
        nodes.iter().all(|n| !n.deliveries().is_empty())
    }));
    for node in &nodes {
        let first = &node.deliveries()[0];
        assert_eq!(
            first.version,
            recovery_level + 1,
            "node {} did not resume at the recovery point",
            node.id
        );
        assert_eq!(first.payload, b"after restart".to_vec());
    }

    // And the new version is durable in the recovered logs.
    assert!(wait_until(Duration::from_secs(30), || {
        nodes.iter().all(|n| {
            n.group
                .get_subgroup(CACHE, 0)
                .and_then(|h| h.get_global_persistence_frontier())
                .map(|v| v.as_i64() >= recovery_level + 1)
                .unwrap_or(false)
        })
    }));

    for node in &nodes {
        node.group.shutdown();
    }
}
