//! Signed version logs: every persisted version carries an Ed25519
//! signature, peers verify one another's published signatures, and the
//! verified frontier advances only over checkable versions.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{node_config, send_until_accepted, small_profile, wait_until, Delivery, CACHE};
use sirocco_crypto::{SigningIdentity, VerifyingIdentity};
use sirocco_group::{GroupBuilder, UserCallbacks};
use sirocco_rbm::LoopbackTransport;
use sirocco_sst::MemoryFabric;
use sirocco_types::{MemberAddress, NodeId};

const LAYOUT: &str = r#"[ { "name": "cache", "shards": [ { "members": [1, 2, 3] } ] } ]"#;

#[test]
fn verified_frontier_advances_with_signed_logs() {
    let ids = [1u32, 2, 3];
    let identities: Vec<SigningIdentity> = ids.iter().map(|_| SigningIdentity::generate()).collect();
    let public: Vec<VerifyingIdentity> =
        identities.iter().map(|i| i.verifying_identity()).collect();

    let fabric = MemoryFabric::new();
    let transport = LoopbackTransport::new();
    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("node.key");
        std::fs::write(&key_path, identities[i].seed_bytes()).expect("write key");

        let mut config = node_config(*id, LAYOUT, &small_profile(), true);
        config.pers.private_key_file = Some(key_path.display().to_string());

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

        let mut builder = GroupBuilder::new(config)
            .callbacks(callbacks)
            .register_type(CACHE, "cache", Box::new(|_| Box::new(())))
            .in_process(fabric.clone(), transport.clone(), NodeId::new(*id))
            .persist_dir(dir.path());
        for (j, peer) in ids.iter().enumerate() {
            if peer != id {
                builder = builder.peer_key(NodeId::new(*peer), public[j].clone());
            }
        }
        let group = builder.build().expect("group builds");
        nodes.push((*id, group, delivered, dir));
    }

    let roster: Vec<(NodeId, MemberAddress)> = nodes
        .iter()
        .map(|(id, group, _, _)| {
            let view = group.current_view();
            (NodeId::new(*id), view.addresses[view.my_rank.as_usize()])
        })
        .collect();
    std::thread::scope(|scope| {
        for (_, group, _, _) in &nodes {
            let roster = roster.clone();
            scope.spawn(move || group.start_founding(roster).expect("founding"));
        }
    });

    const COUNT: i64 = 40;
    let handle = nodes[0].1.get_subgroup(CACHE, 0).expect("handle");
    for i in 0..COUNT {
        assert!(send_until_accepted(
            &handle,
            &[i as u8; 200],
            Duration::from_secs(30)
        ));
    }

    // Every member verifies every peer's signatures up to the frontier.
    for (id, group, _, _) in &nodes {
        let handle = group.get_subgroup(CACHE, 0).unwrap();
        assert!(
            wait_until(Duration::from_secs(60), || {
                handle
                    .get_global_verified_frontier()
                    .map(|v| v.as_i64() >= COUNT - 2)
                    .unwrap_or(false)
            }),
            "node {id} verified frontier stalled at {:?}",
            handle.get_global_verified_frontier()
        );
        // verified <= persisted, always.
        let verified = handle.get_global_verified_frontier().unwrap();
        let persisted = handle.get_global_persistence_frontier().unwrap();
        assert!(verified <= persisted);
    }

    for (_, group, _, _) in &nodes {
        group.shutdown();
    }
}
