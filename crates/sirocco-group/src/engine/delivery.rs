//! Receipt accounting, stability, and ordered delivery.
//!
//! The pipeline per shard:
//!
//! 1. A message arrives (bulk completion or small-message slot scan)
//!    and is buffered under its global sequence number; the sender's
//!    receipt counter in our row advances to the highest *contiguous*
//!    per-sender index.
//! 2. The stability pass folds the column-wise minimum of every
//!    sender's counter over the shard's live rows into a global
//!    round-robin frontier and publishes it as our `seq_num`.
//! 3. The delivery pass walks global sequence numbers up to the minimum
//!    `seq_num` across live rows (the stable prefix), assigning a
//!    version to each message, invoking the callbacks, and handing
//!    non-null payloads to the persistence thread.
//!
//! The round-robin conversion: with `n` senders and `m_j` the highest
//! contiguous index received from sender `j` everywhere, the first
//! missing global sequence is `min_j((m_j + 1) * n + j)`, so the stable
//! frontier is one less than that.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use sirocco_sst::{PredicateHandle, PredicateKind};
use sirocco_types::{
    DeliveryMode, MessageHeader, SequenceNumber, SubgroupId, Version, HEADER_SIZE,
};
use tracing::{debug, trace, warn};

use super::{EngineShared, MsgState, PendingMessage, PersistCommand};
use crate::settings::SLOT_LEN_PREFIX;

// ============================================================================
// Receipt tracking
// ============================================================================

/// Tracks per-sender message indices as they arrive, possibly out of
/// order across the two transport paths, and exposes the highest
/// contiguous frontier. The receipt counter published in the state
/// table must never claim an index whose predecessors are missing.
#[derive(Debug, Default)]
pub(crate) struct ReceiptTracker {
    frontier: i32,
    pending: BTreeSet<i32>,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self {
            frontier: -1,
            pending: BTreeSet::new(),
        }
    }

    /// Records receipt of `count` consecutive indices starting at
    /// `first`.
    pub fn add_range(&mut self, first: i32, count: u32) {
        for idx in first..first + count as i32 {
            if idx > self.frontier {
                self.pending.insert(idx);
            }
        }
        while self.pending.remove(&(self.frontier + 1)) {
            self.frontier += 1;
        }
    }

    /// Highest index `f` such that all of `0..=f` have arrived.
    pub fn frontier(&self) -> i32 {
        self.frontier
    }
}

// ============================================================================
// Receive paths
// ============================================================================

impl EngineShared {
    /// Buffers a message (or the slots of a null message) and advances
    /// the sender's receipt tracker. Returns the new contiguous
    /// frontier for that sender. Caller publishes it to the table after
    /// releasing the state lock.
    pub(crate) fn account_receipt(
        &self,
        state: &mut MsgState,
        subgroup: SubgroupId,
        sender_rank: u32,
        sender_shard_rank: u32,
        header: MessageHeader,
        bytes: Bytes,
    ) -> i32 {
        let s = &self.settings[&subgroup];
        let n = i64::from(s.num_senders());
        let sub = state
            .subgroups
            .get_mut(&subgroup)
            .expect("settings and state agree");
        let count = header.num_nulls.max(1);
        for j in 0..count {
            let index = header.index + j as i32;
            let seq = SequenceNumber::from_parts(sender_rank, index, n as u32).as_i64();
            sub.buffered.insert(
                seq,
                PendingMessage {
                    header,
                    sender_shard_rank,
                    bytes: if j == 0 { bytes.clone() } else { Bytes::new() },
                    primary: j == 0,
                },
            );
        }
        let tracker = &mut sub.receipts[sender_rank as usize];
        tracker.add_range(header.index, count);
        tracker.frontier()
    }

    /// Publishes a sender's receipt frontier into our row.
    pub(crate) fn publish_receipt(&self, subgroup: SubgroupId, sender_rank: u32, frontier: i32) {
        let s = &self.settings[&subgroup];
        let offset = s.num_received_offset + sender_rank as usize;
        self.sst.write_local(|row| {
            if row.num_received[offset] < frontier {
                row.num_received[offset] = frontier;
            }
        });
        if let Err(e) = self.sst.push_row_except_slots() {
            warn!(%subgroup, error = %e, "receipt publish failed");
        }
    }

    /// Completion path for bulk multicast messages.
    pub(crate) fn handle_bulk_message(
        &self,
        subgroup: SubgroupId,
        sender_rank: u32,
        sender_shard_rank: u32,
        size: usize,
        bytes: Bytes,
    ) {
        let bytes = bytes.slice(..size);
        let header = match MessageHeader::decode(&bytes) {
            Ok(h) => h,
            Err(e) => {
                warn!(%subgroup, error = %e, "dropping bulk message with bad header");
                return;
            }
        };
        let frontier = {
            let mut state = self.state.lock().expect("engine state poisoned");
            self.account_receipt(&mut state, subgroup, sender_rank, sender_shard_rank, header, bytes)
        };
        self.publish_receipt(subgroup, sender_rank, frontier);
    }

    /// Scan pass for the small-message path: consume any slots peers
    /// have written since we last looked.
    fn scan_smc_slots(&self, subgroup: SubgroupId) {
        let s = &self.settings[&subgroup];
        let column = self.column(subgroup);
        let window = s.profile.window_size as i32;
        let slot_size = s.slot_size();
        let my_sender_rank = s.sender_rank;

        for sender_rank in 0..s.num_senders() {
            if Some(sender_rank) == my_sender_rank {
                continue;
            }
            let Some(sender_shard_rank) = s.shard_rank_of_sender(sender_rank) else {
                continue;
            };
            let row_index = self.shard_rows[&subgroup][sender_shard_rank as usize];
            if self.sst.is_frozen(row_index) {
                continue;
            }
            loop {
                let seen = {
                    let state = self.state.lock().expect("engine state poisoned");
                    state.subgroups[&subgroup].smc_seen[sender_rank as usize]
                };
                let (written, message) = {
                    let row = self.sst.read(row_index);
                    let written = row.index[column];
                    if written <= seen {
                        (written, None)
                    } else {
                        let slot = (seen % window) as usize;
                        let start = s.slot_offset + slot * slot_size;
                        let len = u32::from_le_bytes(
                            row.slots[start..start + SLOT_LEN_PREFIX]
                                .try_into()
                                .expect("slot prefix is 4 bytes"),
                        ) as usize;
                        let body =
                            Bytes::copy_from_slice(&row.slots[start + SLOT_LEN_PREFIX..start + SLOT_LEN_PREFIX + len]);
                        (written, Some(body))
                    }
                };
                let Some(body) = message else { break };
                let header = match MessageHeader::decode(&body) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(%subgroup, sender_rank, error = %e, "bad small-message header");
                        break;
                    }
                };
                trace!(%subgroup, sender_rank, index = header.index, written, "small message consumed");
                let frontier = {
                    let mut state = self.state.lock().expect("engine state poisoned");
                    let sub = state
                        .subgroups
                        .get_mut(&subgroup)
                        .expect("settings and state agree");
                    sub.smc_seen[sender_rank as usize] = seen + 1;
                    self.account_receipt(
                        &mut state,
                        subgroup,
                        sender_rank,
                        sender_shard_rank,
                        header,
                        body,
                    )
                };
                self.publish_receipt(subgroup, sender_rank, frontier);
            }
        }
    }

    // ========================================================================
    // Stability
    // ========================================================================

    /// Folds receipt counters into the stable frontier and publishes it
    /// as our `seq_num`.
    fn update_stability(&self, subgroup: SubgroupId) {
        let s = &self.settings[&subgroup];
        let column = self.column(subgroup);
        let n = s.num_senders();
        if n == 0 {
            return;
        }
        let live = self.live_shard_rows(subgroup);
        if live.is_empty() {
            return;
        }
        let offset = s.num_received_offset;
        let mut mins = vec![i32::MAX; n as usize];
        for rank in &live {
            let row = self.sst.read(*rank);
            for (j, min) in mins.iter_mut().enumerate() {
                *min = (*min).min(row.num_received[offset + j]);
            }
        }
        let first_missing = mins
            .iter()
            .enumerate()
            .map(|(j, m)| (i64::from(*m) + 1) * i64::from(n) + j as i64)
            .min()
            .expect("at least one sender");
        let frontier = SequenceNumber::new(first_missing - 1);

        let current = self.sst.read_local().seq_num[column];
        if frontier > current {
            self.sst.write_local(|row| row.seq_num[column] = frontier);
            if let Err(e) = self.sst.push_row_except_slots() {
                warn!(%subgroup, error = %e, "stability publish failed");
            }
        }
    }

    /// The round-robin frontier implied by this node's own receipt
    /// counters alone.
    fn local_receipt_frontier(&self, subgroup: SubgroupId) -> SequenceNumber {
        let s = &self.settings[&subgroup];
        let n = s.num_senders();
        if n == 0 {
            return SequenceNumber::NONE;
        }
        let row = self.sst.read_local();
        let first_missing = (0..n as usize)
            .map(|j| {
                (i64::from(row.num_received[s.num_received_offset + j]) + 1) * i64::from(n)
                    + j as i64
            })
            .min()
            .expect("at least one sender");
        SequenceNumber::new(first_missing - 1)
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Delivers the deliverable prefix. Ordered shards wait for
    /// stability (the minimum `seq_num` across live shard rows) so
    /// every member walks the identical prefix. Unordered shards are
    /// best-effort: the local in-order receipt frontier is enough.
    fn deliver_ready(&self, subgroup: SubgroupId) {
        let s = &self.settings[&subgroup];
        let column = self.column(subgroup);
        let live = self.live_shard_rows(subgroup);
        if live.is_empty() {
            return;
        }
        let min_stable = match s.mode {
            DeliveryMode::Ordered => live
                .iter()
                .map(|r| self.sst.read(*r).seq_num[column])
                .min()
                .expect("nonempty live set"),
            DeliveryMode::Unordered => self.local_receipt_frontier(subgroup),
        };
        let delivered = self.sst.read_local().delivered_num[column];
        if min_stable <= delivered {
            return;
        }

        let mut state = self.state.lock().expect("engine state poisoned");
        let (new_delivered, latest_ts, freed) =
            self.deliver_range(&mut state, subgroup, delivered, min_stable, None);
        drop(state);

        if freed {
            self.sender_cv.notify_all();
        }
        if new_delivered > delivered {
            self.sst.write_local(|row| {
                row.delivered_num[column] = new_delivered;
                if row.local_stability_frontier[column] < latest_ts {
                    row.local_stability_frontier[column] = latest_ts;
                }
            });
            if let Err(e) = self.sst.push_row_except_slots() {
                warn!(%subgroup, error = %e, "delivery publish failed");
            }
        }
    }

    /// Walks `(from, upto]` in sequence order delivering buffered
    /// messages. With `trim`, sequences whose per-sender index exceeds
    /// the trim frontier are skipped (view-change drain); without it, a
    /// missing sequence stops the walk.
    ///
    /// Returns `(delivered frontier, latest timestamp, freed own slots)`.
    fn deliver_range(
        &self,
        state: &mut MsgState,
        subgroup: SubgroupId,
        from: SequenceNumber,
        upto: SequenceNumber,
        trim: Option<&[i32]>,
    ) -> (SequenceNumber, u64, bool) {
        let s = &self.settings[&subgroup];
        let n = s.num_senders();
        let my_shard_rank = s.shard_rank;
        let sub = state
            .subgroups
            .get_mut(&subgroup)
            .expect("settings and state agree");

        let mut delivered = from;
        let mut latest_ts = 0;
        let mut freed = false;
        let mut seq = from.as_i64() + 1;
        while seq <= upto.as_i64() {
            let sender = SequenceNumber::new(seq).sender_rank(n);
            let index = SequenceNumber::new(seq).index(n);
            if let Some(trim) = trim {
                if index > trim[sender as usize] {
                    // Beyond this sender's agreed frontier; the slot is
                    // skipped, not delivered.
                    delivered = SequenceNumber::new(seq);
                    seq += 1;
                    continue;
                }
            }
            let Some(msg) = sub.buffered.remove(&seq) else {
                if trim.is_some() {
                    warn!(%subgroup, seq, "trim frontier references an unbuffered message");
                    delivered = SequenceNumber::new(seq);
                    seq += 1;
                    continue;
                }
                break;
            };

            if msg.primary && msg.sender_shard_rank == my_shard_rank && sub.in_flight > 0 {
                sub.in_flight -= 1;
                freed = true;
            }
            latest_ts = latest_ts.max(msg.header.timestamp);
            delivered = SequenceNumber::new(seq);
            seq += 1;

            if msg.header.is_null() || !msg.primary {
                // Null slots advance the frontier without callbacks or
                // persistence.
                continue;
            }

            let version = Version::new(
                self.next_version[&subgroup].fetch_add(1, Ordering::AcqRel),
            );
            self.delivered_version[&subgroup].store(version.as_i64(), Ordering::Release);
            let sender_node = s.members[msg.sender_shard_rank as usize];

            if let Some(cb) = &self.callbacks.post_next_version {
                cb(subgroup, version, msg.header.timestamp);
            }
            let payload = msg.bytes.slice(HEADER_SIZE..);
            if msg.header.cooked {
                if let Some(cb) = &self.callbacks.rpc {
                    cb(subgroup, sender_node, &payload, version);
                }
            } else if let Some(cb) = &self.callbacks.user.stability {
                cb(subgroup, sender_node, index, Some(&payload), version);
            }
            let _ = self.persist_tx.send(PersistCommand::Version {
                subgroup,
                version,
                timestamp: msg.header.timestamp,
                payload,
            });
        }
        (delivered, latest_ts, freed)
    }
}

// ============================================================================
// View-change drain
// ============================================================================

/// Implements `deliver_messages_upto`: brings `delivered_num` exactly
/// to the agreed per-sender trim frontier and discards everything
/// beyond it.
pub(super) fn deliver_upto(shared: &EngineShared, max_indices: &[i32], subgroup: SubgroupId) {
    let Some(s) = shared.settings.get(&subgroup) else {
        return;
    };
    let column = shared.column(subgroup);
    let n = s.num_senders();
    if n == 0 || max_indices.len() != n as usize {
        warn!(%subgroup, "trim vector does not match sender count");
        return;
    }

    let mut state = shared.state.lock().expect("engine state poisoned");
    let sub = state
        .subgroups
        .get_mut(&subgroup)
        .expect("settings and state agree");
    if sub.trimmed {
        return;
    }
    sub.trimmed = true;

    let target = max_indices
        .iter()
        .enumerate()
        .filter(|(_, idx)| **idx >= 0)
        .map(|(j, idx)| SequenceNumber::from_parts(j as u32, *idx, n))
        .max()
        .unwrap_or(SequenceNumber::NONE);

    let delivered = shared.sst.read_local().delivered_num[column];
    debug!(
        %subgroup,
        ?max_indices,
        from = %delivered,
        upto = %target,
        "draining to trim frontier"
    );
    let (new_delivered, latest_ts, _) =
        shared.deliver_range(&mut state, subgroup, delivered, target, Some(max_indices));

    // Everything past the frontier is discarded; the next view's engine
    // starts clean.
    let sub = state
        .subgroups
        .get_mut(&subgroup)
        .expect("settings and state agree");
    sub.buffered.clear();
    sub.in_flight = 0;
    drop(state);
    shared.sender_cv.notify_all();

    shared.sst.write_local(|row| {
        if new_delivered > row.delivered_num[column] {
            row.delivered_num[column] = new_delivered;
        }
        if row.local_stability_frontier[column] < latest_ts {
            row.local_stability_frontier[column] = latest_ts;
        }
    });
    if let Err(e) = shared.sst.push_row_except_slots() {
        warn!(%subgroup, error = %e, "trim publish failed");
    }
}

// ============================================================================
// Predicate registration
// ============================================================================

/// Registers the receive/stability/delivery passes for every subgroup
/// this engine participates in. The closures hold weak references: the
/// predicates must not keep a dead engine alive through the table.
pub(super) fn register_predicates(shared: &Arc<EngineShared>) -> Vec<PredicateHandle> {
    let mut handles = Vec::new();
    let subgroups: Vec<SubgroupId> = shared.settings.keys().copied().collect();
    for subgroup in subgroups {
        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        handles.push(shared.sst.register_predicate(
            "smc_receive",
            |_| true,
            move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.scan_smc_slots(subgroup);
                }
            },
            PredicateKind::Recurrent,
        ));

        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        handles.push(shared.sst.register_predicate(
            "stability",
            |_| true,
            move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.update_stability(subgroup);
                }
            },
            PredicateKind::Recurrent,
        ));

        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        handles.push(shared.sst.register_predicate(
            "delivery",
            |_| true,
            move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.deliver_ready(subgroup);
                }
            },
            PredicateKind::Recurrent,
        ));
    }
    handles
}
