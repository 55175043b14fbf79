//! Restart after total failure.
//!
//! When every member is down, nobody holds an installed view to change;
//! the group has to be reconstructed from the durable logs. Each
//! restarting node reads its restart metadata (last installed view,
//! verified frontier per subgroup) and its version logs, then
//! rendezvouses on the configured restart leader over a dedicated
//! restart port:
//!
//! 1. Reporters poll the restart leader with [`ControlFrame::RestartReport`]
//!    frames carrying their durable state.
//! 2. The leader waits (bounded by `restart_timeout_ms`) until the
//!    reports cover a majority of the last installed view's roster.
//! 3. It then picks, per subgroup, the reporter with the highest
//!    verified (or, unsigned, persisted) frontier as the shard leader
//!    for state transfer, fixes the recovery view id above every
//!    reported one, and answers each poll with a
//!    [`ControlFrame::RestartView`].
//!
//! With backup restart leaders enabled, a reporter that cannot reach
//! the primary within the timeout moves down the configured leader
//! list; a configured backup that exhausts the leaders ahead of itself
//! takes over the leader role.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sirocco_persist::{RestartMeta, VersionLog};
use sirocco_types::{MemberAddress, NodeId, SubgroupId, View, ViewId};
use tracing::{debug, info, warn};

use crate::control::{ControlConnection, ControlFrame, ControlServer};
use crate::GroupError;

/// What the rendezvous agrees on.
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    /// The recovery view (shard assignments filled in by the caller's
    /// provisioner).
    pub view: View,
    /// Per subgroup, the node holding the most complete log.
    pub shard_leaders: BTreeMap<u32, u32>,
    /// Per subgroup, the version counter the recovered engines resume
    /// from.
    pub next_version: BTreeMap<u32, i64>,
}

/// Rendezvous parameters, distilled from node configuration.
#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub my_node: NodeId,
    pub my_address: MemberAddress,
    /// Restart leader addresses (host restart port), in priority order.
    pub leaders: Vec<SocketAddr>,
    /// This node's position in `leaders`, if it is one of them.
    pub my_leader_index: Option<usize>,
    pub restart_timeout: Duration,
    pub enable_backup_leaders: bool,
    /// All subgroups of the configured layout.
    pub subgroups: Vec<SubgroupId>,
    pub max_log_entry: u64,
    pub max_data_size: u64,
}

#[derive(Debug, Clone)]
struct Report {
    node: u32,
    address: MemberAddress,
    last_vid: i32,
    verified: BTreeMap<u32, i64>,
}

/// Runs the rendezvous and returns the agreed recovery plan.
///
/// Must run before the view manager binds its control ports; the
/// leader serves the rendezvous on the dedicated restart port and shuts
/// it down before returning.
pub fn restart_rendezvous(
    config: &RestartConfig,
    persist_dir: &Path,
) -> Result<RestartOutcome, GroupError> {
    let my_report = local_report(config, persist_dir)?;
    let meta = RestartMeta::load(persist_dir)?;

    let mut leader_cursor = 0usize;
    loop {
        if config.my_leader_index == Some(leader_cursor) {
            info!(cursor = leader_cursor, "acting as restart leader");
            return lead_rendezvous(config, &meta, my_report);
        }
        let Some(leader_addr) = config.leaders.get(leader_cursor).copied() else {
            return Err(GroupError::RestartTimeout {
                timeout_ms: config.restart_timeout.as_millis() as u64,
                reached: 0,
                needed: quorum_size(&meta),
            });
        };
        match poll_leader(config, leader_addr, &my_report) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                warn!(leader = %leader_addr, error = %e, "restart leader unreachable");
                if !config.enable_backup_leaders {
                    return Err(e);
                }
                leader_cursor += 1;
            }
        }
    }
}

fn local_report(config: &RestartConfig, persist_dir: &Path) -> Result<Report, GroupError> {
    let meta = RestartMeta::load(persist_dir)?;
    let mut verified = BTreeMap::new();
    for subgroup in &config.subgroups {
        let log = VersionLog::open(
            persist_dir,
            *subgroup,
            false,
            config.max_log_entry,
            config.max_data_size,
        )?;
        // Signed deployments trust only the verified frontier; without
        // signatures the durable frontier is the best we have.
        let from_meta = meta.verified_for(*subgroup);
        let level = if from_meta.is_valid() {
            from_meta.as_i64()
        } else {
            log.last_version().as_i64()
        };
        verified.insert(subgroup.as_u32(), level);
    }
    Ok(Report {
        node: config.my_node.as_u32(),
        address: config.my_address,
        last_vid: meta.last_vid.map(|v| v.as_i32()).unwrap_or(-1),
        verified,
    })
}

fn quorum_size(meta: &RestartMeta) -> usize {
    if meta.last_members.is_empty() {
        1
    } else {
        meta.last_members.len() / 2 + 1
    }
}

// ============================================================================
// Reporter side
// ============================================================================

fn poll_leader(
    config: &RestartConfig,
    leader: SocketAddr,
    report: &Report,
) -> Result<RestartOutcome, GroupError> {
    let deadline = Instant::now() + config.restart_timeout;
    loop {
        let attempt = (|| -> Result<Option<RestartOutcome>, GroupError> {
            let mut conn = ControlConnection::connect(leader, Duration::from_millis(500))?;
            conn.send(&ControlFrame::RestartReport {
                node: report.node,
                address: report.address,
                last_vid: report.last_vid,
                verified: report.verified.clone(),
            })?;
            conn.set_read_timeout(Some(Duration::from_millis(500)))?;
            match conn.recv() {
                Ok(ControlFrame::RestartView {
                    view,
                    shard_leaders,
                    next_version,
                }) => Ok(Some(RestartOutcome {
                    view: reroot_view(view, NodeId::new(report.node)),
                    shard_leaders,
                    next_version,
                })),
                Ok(_) => Ok(None),
                Err(GroupError::Control(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })();
        match attempt {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "restart poll attempt failed");
            }
        }
        if Instant::now() >= deadline {
            return Err(GroupError::RestartTimeout {
                timeout_ms: config.restart_timeout.as_millis() as u64,
                reached: 0,
                needed: 1,
            });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// A broadcast view arrives rooted at the leader; re-root `my_rank` for
/// the local node.
fn reroot_view(view: View, my_node: NodeId) -> View {
    let mut view = view;
    if let Some(rank) = view.rank_of(my_node) {
        view.my_rank = rank;
    }
    view
}

// ============================================================================
// Leader side
// ============================================================================

struct LeaderState {
    reports: BTreeMap<u32, Report>,
    decision: Option<(View, BTreeMap<u32, u32>, BTreeMap<u32, i64>)>,
    fetched: Vec<u32>,
}

fn lead_rendezvous(
    config: &RestartConfig,
    meta: &RestartMeta,
    my_report: Report,
) -> Result<RestartOutcome, GroupError> {
    let needed = quorum_size(meta);
    let state = Arc::new(Mutex::new(LeaderState {
        reports: BTreeMap::from([(my_report.node, my_report.clone())]),
        decision: None,
        fetched: Vec::new(),
    }));

    let handler_state = state.clone();
    let my_node = config.my_node;
    let listen = config
        .leaders
        .get(config.my_leader_index.unwrap_or(0))
        .copied()
        .ok_or(GroupError::RestartTimeout {
            timeout_ms: config.restart_timeout.as_millis() as u64,
            reached: 0,
            needed,
        })?;
    let mut server = ControlServer::start(
        listen,
        Arc::new(move |frame, conn| {
            if let ControlFrame::RestartReport {
                node,
                address,
                last_vid,
                verified,
            } = frame
            {
                let mut state = handler_state.lock().expect("restart state poisoned");
                state.reports.insert(
                    node,
                    Report {
                        node,
                        address,
                        last_vid,
                        verified,
                    },
                );
                if let Some((view, shard_leaders, next_version)) = &state.decision {
                    let _ = conn.send(&ControlFrame::RestartView {
                        view: reroot_view(view.clone(), my_node),
                        shard_leaders: shard_leaders.clone(),
                        next_version: next_version.clone(),
                    });
                    if !state.fetched.contains(&node) {
                        state.fetched.push(node);
                    }
                }
            }
            false
        }),
    )?;

    // Phase 1: wait for a quorum of the last view.
    let deadline = Instant::now() + config.restart_timeout;
    loop {
        let reached = {
            let state = state.lock().expect("restart state poisoned");
            count_quorum(&state.reports, meta)
        };
        if reached >= needed {
            break;
        }
        if Instant::now() >= deadline {
            server.stop();
            return Err(GroupError::RestartTimeout {
                timeout_ms: config.restart_timeout.as_millis() as u64,
                reached,
                needed,
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Phase 2: decide.
    let outcome = {
        let mut state = state.lock().expect("restart state poisoned");
        let decision = decide(config, &state.reports);
        state.decision = Some(decision.clone());
        info!(
            vid = decision.0.vid.as_i32(),
            members = state.reports.len(),
            "restart view decided"
        );
        RestartOutcome {
            view: reroot_view(decision.0.clone(), my_node),
            shard_leaders: decision.1,
            next_version: decision.2,
        }
    };

    // Phase 3: drain. Answer each reporter's next poll, bounded.
    let drain_deadline = Instant::now() + config.restart_timeout;
    loop {
        let done = {
            let state = state.lock().expect("restart state poisoned");
            outcome
                .view
                .members
                .iter()
                .all(|m| *m == my_node || state.fetched.contains(&m.as_u32()))
        };
        if done || Instant::now() >= drain_deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    server.stop();
    Ok(outcome)
}

fn count_quorum(reports: &BTreeMap<u32, Report>, meta: &RestartMeta) -> usize {
    if meta.last_members.is_empty() {
        return reports.len();
    }
    meta.last_members
        .iter()
        .filter(|m| reports.contains_key(m))
        .count()
}

fn decide(
    config: &RestartConfig,
    reports: &BTreeMap<u32, Report>,
) -> (View, BTreeMap<u32, u32>, BTreeMap<u32, i64>) {
    let members: Vec<NodeId> = reports.keys().copied().map(NodeId::new).collect();
    let addresses: Vec<MemberAddress> = reports.values().map(|r| r.address).collect();
    let max_vid = reports.values().map(|r| r.last_vid).max().unwrap_or(-1);
    let view = View::new(
        ViewId::new(max_vid + 1),
        members,
        addresses,
        config.my_node,
    );

    let mut shard_leaders = BTreeMap::new();
    let mut next_version = BTreeMap::new();
    for subgroup in &config.subgroups {
        let sg = subgroup.as_u32();
        // Highest frontier wins; ties break toward the lower node id
        // (BTreeMap order makes the first maximal entry the lowest id).
        let best = reports
            .values()
            .map(|r| (r.verified.get(&sg).copied().unwrap_or(-1), r.node))
            .fold(None::<(i64, u32)>, |acc, (level, node)| match acc {
                Some((best_level, _)) if level > best_level => Some((level, node)),
                None => Some((level, node)),
                other => other,
            });
        if let Some((level, node)) = best {
            shard_leaders.insert(sg, node);
            next_version.insert(sg, level + 1);
        }
    }
    (view, shard_leaders, next_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(node: u32, vid: i32, verified: &[(u32, i64)]) -> Report {
        Report {
            node,
            address: MemberAddress::localhost(40_000 + node as u16 * 10),
            last_vid: vid,
            verified: verified.iter().copied().collect(),
        }
    }

    fn config(subgroups: &[u32]) -> RestartConfig {
        RestartConfig {
            my_node: NodeId::new(1),
            my_address: MemberAddress::localhost(40_010),
            leaders: vec![],
            my_leader_index: Some(0),
            restart_timeout: Duration::from_secs(1),
            enable_backup_leaders: false,
            subgroups: subgroups.iter().copied().map(SubgroupId::new).collect(),
            max_log_entry: 1 << 20,
            max_data_size: 1 << 30,
        }
    }

    #[test]
    fn decision_picks_highest_frontier() {
        let mut reports = BTreeMap::new();
        reports.insert(1, report(1, 4, &[(0, 100)]));
        reports.insert(2, report(2, 5, &[(0, 250)]));
        reports.insert(3, report(3, 5, &[(0, 200)]));

        let (view, leaders, next) = decide(&config(&[0]), &reports);
        assert_eq!(view.vid, ViewId::new(6));
        assert_eq!(
            view.members,
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
        );
        assert_eq!(leaders[&0], 2);
        assert_eq!(next[&0], 251);
    }

    #[test]
    fn frontier_ties_break_to_lower_node_id() {
        let mut reports = BTreeMap::new();
        reports.insert(3, report(3, 2, &[(0, 50)]));
        reports.insert(2, report(2, 2, &[(0, 50)]));

        let (_, leaders, _) = decide(&config(&[0]), &reports);
        assert_eq!(leaders[&0], 2);
    }

    #[test]
    fn quorum_counts_only_last_view_members() {
        let meta = RestartMeta {
            last_vid: Some(ViewId::new(3)),
            last_members: vec![1, 2, 3, 4],
            verified: BTreeMap::new(),
        };
        let mut reports = BTreeMap::new();
        reports.insert(1, report(1, 3, &[]));
        reports.insert(9, report(9, -1, &[])); // never a member
        assert_eq!(count_quorum(&reports, &meta), 1);
        reports.insert(2, report(2, 3, &[]));
        reports.insert(3, report(3, 3, &[]));
        assert_eq!(count_quorum(&reports, &meta), 3);
        assert_eq!(quorum_size(&meta), 3);
    }
}
