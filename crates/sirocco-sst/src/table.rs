//! The shared state table proper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use sirocco_types::NodeId;
use tracing::{debug, trace, warn};

use crate::fabric::{RowFabric, RowUpdate};
use crate::predicates::{PredicateEngine, PredicateHandle, PredicateKind};
use crate::row::{SstRow, SstSchema};
use crate::SstError;

/// Callback invoked (on the pushing thread) when a push to a peer
/// fails; receives the peer's rank. The view manager installs one to
/// turn push failures into suspicions.
pub type FailureHandler = Box<dyn Fn(usize) + Send + Sync>;

/// What [`Sst::apply_remote`] did with an inbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Merged into the table.
    Applied,
    /// Belonged to a past view (or a frozen row); discarded.
    DroppedStale,
    /// Belongs to a view this table has not installed; the fabric
    /// should retry against the successor table.
    FutureView,
}

/// A replicated row-per-member table.
///
/// The local process owns exactly one row (`my_rank`) and mutates it
/// through [`Sst::write_local`]; every other row is a replica of some
/// peer's row, updated by [`Sst::apply_remote`] when the fabric delivers
/// a push. All rows are readable at any time.
pub struct Sst {
    schema: SstSchema,
    members: Vec<NodeId>,
    my_rank: usize,
    rows: Vec<RwLock<SstRow>>,
    frozen: Vec<AtomicBool>,
    fabric: Arc<dyn RowFabric>,
    /// Serializes snapshot-and-fan-out so peers observe this row's
    /// writes in program order even when several threads push.
    push_lock: Mutex<()>,
    predicates: PredicateEngine,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    shutdown: AtomicBool,
    failure_handler: Mutex<Option<FailureHandler>>,
    predicate_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sst {
    /// Builds the table for one view and starts its predicate thread.
    ///
    /// `members` is the view's ordered member list; `my_node` must be
    /// one of them. `now_ns` seeds the heartbeat columns.
    pub fn new(
        schema: SstSchema,
        members: Vec<NodeId>,
        my_node: NodeId,
        fabric: Arc<dyn RowFabric>,
        now_ns: u64,
    ) -> Result<Arc<Self>, SstError> {
        let my_rank = members
            .iter()
            .position(|m| *m == my_node)
            .ok_or(SstError::UnknownOrigin { origin: my_node })?;
        let rows = (0..members.len())
            .map(|_| RwLock::new(schema.new_row(now_ns)))
            .collect();
        let frozen = (0..members.len()).map(|_| AtomicBool::new(false)).collect();
        let (wake_tx, wake_rx) = bounded(1);

        let sst = Arc::new(Self {
            schema,
            members,
            my_rank,
            rows,
            frozen,
            fabric,
            push_lock: Mutex::new(()),
            predicates: PredicateEngine::default(),
            wake_tx,
            wake_rx,
            shutdown: AtomicBool::new(false),
            failure_handler: Mutex::new(None),
            predicate_thread: Mutex::new(None),
        });
        sst.start_predicate_thread();
        Ok(sst)
    }

    fn start_predicate_thread(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let rx = self.wake_rx.clone();
        let handle = std::thread::Builder::new()
            .name("sst-predicates".to_string())
            .spawn(move || loop {
                // Coalesced wake with a periodic fallback pass; heartbeat
                // timestamps advance without generating explicit wakes.
                let _ = rx.recv_timeout(Duration::from_millis(10));
                let Some(sst) = weak.upgrade() else { break };
                if sst.shutdown.load(Ordering::Acquire) {
                    break;
                }
                sst.predicates.evaluate(&sst);
            })
            .expect("failed to spawn predicate thread");
        *self
            .predicate_thread
            .lock()
            .expect("predicate thread slot poisoned") = Some(handle);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn schema(&self) -> &SstSchema {
        &self.schema
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn my_node(&self) -> NodeId {
        self.members[self.my_rank]
    }

    /// Read access to any row.
    pub fn read(&self, rank: usize) -> RwLockReadGuard<'_, SstRow> {
        self.rows[rank].read().expect("sst row poisoned")
    }

    /// Read access to the local row.
    pub fn read_local(&self) -> RwLockReadGuard<'_, SstRow> {
        self.read(self.my_rank)
    }

    /// Mutates the local row and wakes the predicate thread. Does not
    /// push; pair with [`Sst::push_row`] to publish.
    pub fn write_local<R>(&self, f: impl FnOnce(&mut SstRow) -> R) -> R {
        let result = {
            let mut row = self.rows[self.my_rank].write().expect("sst row poisoned");
            f(&mut row)
        };
        self.wake();
        result
    }

    // ========================================================================
    // Pushes
    // ========================================================================

    /// Publishes the local row to every live peer.
    pub fn push_row(&self) -> Result<(), SstError> {
        self.push(true)
    }

    /// Publishes the local row with the slot region elided. Receivers
    /// keep their previous slot bytes, so this is safe whenever the
    /// update being published is outside the small-message slots.
    pub fn push_row_except_slots(&self) -> Result<(), SstError> {
        self.push(false)
    }

    fn push(&self, include_slots: bool) -> Result<(), SstError> {
        let _ordering = self.push_lock.lock().expect("push lock poisoned");
        let row_bytes = {
            let row = self.read_local();
            if include_slots {
                postcard::to_allocvec(&*row)?
            } else {
                let mut stripped = row.clone();
                stripped.slots = Vec::new();
                postcard::to_allocvec(&stripped)?
            }
        };
        let update = RowUpdate {
            origin: self.my_node(),
            include_slots,
            row_bytes,
        };
        for rank in 0..self.members.len() {
            if rank == self.my_rank || self.is_frozen(rank) {
                continue;
            }
            let node = self.members[rank];
            if let Err(e) = self.fabric.push_row(node, update.clone()) {
                warn!(peer = %node, rank, error = %e, "row push failed; freezing row");
                self.freeze(rank);
                self.report_failure(rank);
            }
        }
        Ok(())
    }

    /// Applies a peer's pushed row into its replica slot.
    ///
    /// Updates from a view this table has passed are dropped; updates
    /// from a view it has not reached yet are reported as
    /// [`ApplyOutcome::FutureView`] so the fabric can hold them until
    /// the next table is bound.
    pub fn apply_remote(&self, update: RowUpdate) -> Result<ApplyOutcome, SstError> {
        let Some(rank) = self.members.iter().position(|m| *m == update.origin) else {
            return Err(SstError::UnknownOrigin {
                origin: update.origin,
            });
        };
        if self.is_frozen(rank) {
            trace!(origin = %update.origin, "dropping update for frozen row");
            return Ok(ApplyOutcome::DroppedStale);
        }
        let incoming: SstRow = postcard::from_bytes(&update.row_bytes)?;
        {
            let mut row = self.rows[rank].write().expect("sst row poisoned");
            if incoming.vid < row.vid {
                trace!(
                    origin = %update.origin,
                    incoming_vid = %incoming.vid,
                    local_vid = %row.vid,
                    "dropping stale row update"
                );
                return Ok(ApplyOutcome::DroppedStale);
            }
            if incoming.vid > row.vid {
                return Ok(ApplyOutcome::FutureView);
            }
            row.merge_from(incoming, update.include_slots);
        }
        self.wake();
        Ok(ApplyOutcome::Applied)
    }

    // ========================================================================
    // Freezing and failure reporting
    // ========================================================================

    /// Marks a row as no longer observed. Idempotent.
    pub fn freeze(&self, rank: usize) {
        if !self.frozen[rank].swap(true, Ordering::AcqRel) {
            debug!(rank, peer = %self.members[rank], "row frozen");
            self.wake();
        }
    }

    pub fn is_frozen(&self, rank: usize) -> bool {
        self.frozen[rank].load(Ordering::Acquire)
    }

    /// Ranks whose rows are still observed, in rank order.
    pub fn live_ranks(&self) -> Vec<usize> {
        (0..self.members.len())
            .filter(|r| !self.is_frozen(*r))
            .collect()
    }

    /// Installs the handler invoked when a push to a peer fails.
    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self
            .failure_handler
            .lock()
            .expect("failure handler poisoned") = Some(handler);
    }

    fn report_failure(&self, rank: usize) {
        let handler = self.failure_handler.lock().expect("failure handler poisoned");
        if let Some(handler) = handler.as_ref() {
            handler(rank);
        }
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    /// Registers a predicate/action pair. The action runs on the
    /// predicate thread whenever the predicate reports true (once for
    /// [`PredicateKind::OneTime`]).
    pub fn register_predicate(
        &self,
        name: &'static str,
        predicate: impl Fn(&Sst) -> bool + Send + 'static,
        action: impl FnMut(&Sst) + Send + 'static,
        kind: PredicateKind,
    ) -> PredicateHandle {
        let handle =
            self.predicates
                .register(name, Box::new(predicate), Box::new(action), kind);
        self.wake();
        handle
    }

    pub fn remove_predicate(&self, handle: PredicateHandle) {
        self.predicates.remove(handle);
    }

    /// Runs one synchronous predicate pass on the calling thread. Test
    /// rigs use this to drive the table deterministically.
    pub fn run_predicates_once(&self) {
        self.predicates.evaluate(self);
    }

    pub fn num_registered_predicates(&self) -> usize {
        self.predicates.len()
    }

    fn wake(&self) {
        match self.wake_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops the predicate thread and waits for it to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
        let handle = self
            .predicate_thread
            .lock()
            .expect("predicate thread slot poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Sst {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::MemoryFabric;
    use std::sync::atomic::AtomicUsize;

    fn schema(num_members: usize) -> SstSchema {
        SstSchema {
            num_members,
            num_subgroups: 1,
            signature_size: 0,
            num_received_size: num_members,
            slots_size: 64,
            index_size: 1,
        }
    }

    fn three_tables() -> (Arc<MemoryFabric>, Vec<Arc<Sst>>) {
        let fabric = MemoryFabric::new();
        let members: Vec<NodeId> = (1..=3).map(NodeId::new).collect();
        let tables: Vec<Arc<Sst>> = members
            .iter()
            .map(|node| {
                Sst::new(
                    schema(3),
                    members.clone(),
                    *node,
                    fabric.clone() as Arc<dyn RowFabric>,
                    0,
                )
                .unwrap()
            })
            .collect();
        for (node, table) in members.iter().zip(&tables) {
            fabric.register(*node, table);
        }
        (fabric, tables)
    }

    #[test]
    fn push_row_replicates_to_peers() {
        let (_fabric, tables) = three_tables();
        tables[0].write_local(|row| {
            row.num_changes = 5;
            row.slots[0] = 0x42;
        });
        tables[0].push_row().unwrap();

        for peer in &tables[1..] {
            let replica = peer.read(0);
            assert_eq!(replica.num_changes, 5);
            assert_eq!(replica.slots[0], 0x42);
        }
        // The pushing node's own replicas of others are untouched.
        assert_eq!(tables[1].read(1).num_changes, 0);
    }

    #[test]
    fn except_slots_preserves_peer_slot_bytes() {
        let (_fabric, tables) = three_tables();
        tables[0].write_local(|row| row.slots[0] = 0x42);
        tables[0].push_row().unwrap();
        assert_eq!(tables[1].read(0).slots[0], 0x42);

        tables[0].write_local(|row| {
            row.slots[0] = 0x99;
            row.num_acked = 2;
        });
        tables[0].push_row_except_slots().unwrap();

        let replica = tables[1].read(0);
        assert_eq!(replica.num_acked, 2);
        // Slot byte kept from the earlier full push.
        assert_eq!(replica.slots[0], 0x42);
    }

    #[test]
    fn failed_push_freezes_row_and_reports() {
        let (fabric, tables) = three_tables();
        let reported = Arc::new(AtomicUsize::new(usize::MAX));
        let reported_clone = reported.clone();
        tables[0].set_failure_handler(Box::new(move |rank| {
            reported_clone.store(rank, Ordering::SeqCst);
        }));

        fabric.cut(NodeId::new(3));
        tables[0].write_local(|row| row.num_changes = 1);
        tables[0].push_row().unwrap();

        assert!(tables[0].is_frozen(2));
        assert_eq!(reported.load(Ordering::SeqCst), 2);
        assert_eq!(tables[0].live_ranks(), vec![0, 1]);
        // The reachable peer still received the push.
        assert_eq!(tables[1].read(0).num_changes, 1);
    }

    #[test]
    fn one_time_predicate_fires_once() {
        let (_fabric, tables) = three_tables();
        let sst = &tables[0];
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        sst.register_predicate(
            "num_changes_nonzero",
            |sst| sst.read_local().num_changes > 0,
            move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::OneTime,
        );

        sst.run_predicates_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sst.write_local(|row| row.num_changes = 1);
        sst.run_predicates_once();
        sst.run_predicates_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(sst.num_registered_predicates(), 0);
    }

    #[test]
    fn recurrent_predicate_fires_every_pass() {
        let (_fabric, tables) = three_tables();
        let sst = &tables[0];
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let handle = sst.register_predicate(
            "always",
            |_| true,
            move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::Recurrent,
        );

        sst.run_predicates_once();
        sst.run_predicates_once();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        sst.remove_predicate(handle);
        sst.run_predicates_once();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn actions_may_register_predicates() {
        let (_fabric, tables) = three_tables();
        let sst = tables[0].clone();
        let inner_fired = Arc::new(AtomicUsize::new(0));
        let inner_clone = inner_fired.clone();
        let sst_for_action = sst.clone();
        sst.register_predicate(
            "outer",
            |_| true,
            move |_| {
                let inner = inner_clone.clone();
                sst_for_action.register_predicate(
                    "inner",
                    |_| true,
                    move |_| {
                        inner.fetch_add(1, Ordering::SeqCst);
                    },
                    PredicateKind::OneTime,
                );
            },
            PredicateKind::OneTime,
        );

        sst.run_predicates_once();
        assert_eq!(inner_fired.load(Ordering::SeqCst), 0);
        sst.run_predicates_once();
        assert_eq!(inner_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cross_view_updates_dropped() {
        let (_fabric, tables) = three_tables();
        tables[1].write_local(|row| row.vid = sirocco_types::ViewId::new(2));
        tables[1].push_row().unwrap();
        // Table 0 still has vid 0 for row 1: the update must not apply.
        assert_eq!(tables[0].read(1).vid, sirocco_types::ViewId::ZERO);
    }
}
