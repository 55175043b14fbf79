//! The predicate engine.
//!
//! Callers register `(predicate, action)` pairs; a dedicated thread
//! re-evaluates every registered predicate after each observed row
//! change and runs the action when its predicate reports true. Actions
//! run on the predicate thread and must not block on application code.
//!
//! Actions may register and remove predicates reentrantly (the view
//! manager does, when it swaps one protocol phase for the next), so the
//! evaluation pass takes the registration list out of the shared slot,
//! runs without holding the lock, and merges registrations made
//! meanwhile back in afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::table::Sst;

/// Re-fire policy of a registered predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    /// Deregistered automatically after its first firing.
    OneTime,
    /// Evaluated on every pass for as long as it stays registered.
    Recurrent,
}

/// Token for deregistering a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateHandle(u64);

type Predicate = Box<dyn Fn(&Sst) -> bool + Send>;
type Action = Box<dyn FnMut(&Sst) + Send>;

struct Registered {
    id: u64,
    name: &'static str,
    kind: PredicateKind,
    predicate: Predicate,
    action: Action,
}

#[derive(Default)]
pub(crate) struct PredicateEngine {
    registered: Mutex<Vec<Registered>>,
    removals: Mutex<Vec<u64>>,
    next_id: AtomicU64,
}

impl PredicateEngine {
    pub(crate) fn register(
        &self,
        name: &'static str,
        predicate: Predicate,
        action: Action,
        kind: PredicateKind,
    ) -> PredicateHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registered
            .lock()
            .expect("predicate list poisoned")
            .push(Registered {
                id,
                name,
                kind,
                predicate,
                action,
            });
        PredicateHandle(id)
    }

    pub(crate) fn remove(&self, handle: PredicateHandle) {
        self.removals
            .lock()
            .expect("predicate removals poisoned")
            .push(handle.0);
    }

    /// One evaluation pass over all registered predicates.
    pub(crate) fn evaluate(&self, sst: &Sst) {
        let current = std::mem::take(
            &mut *self.registered.lock().expect("predicate list poisoned"),
        );
        let removed: Vec<u64> =
            std::mem::take(&mut *self.removals.lock().expect("predicate removals poisoned"));

        let mut survivors = Vec::with_capacity(current.len());
        for mut reg in current {
            if removed.contains(&reg.id) {
                continue;
            }
            let fired = (reg.predicate)(sst);
            if fired {
                trace!(predicate = reg.name, "predicate fired");
                (reg.action)(sst);
            }
            if !(fired && reg.kind == PredicateKind::OneTime) {
                survivors.push(reg);
            }
        }

        // Merge back, keeping anything registered by the actions we just
        // ran, and honoring removals they requested.
        let mut list = self.registered.lock().expect("predicate list poisoned");
        let added = std::mem::take(&mut *list);
        *list = survivors;
        list.extend(added);
        let late_removals: Vec<u64> =
            std::mem::take(&mut *self.removals.lock().expect("predicate removals poisoned"));
        if !late_removals.is_empty() {
            list.retain(|reg| !late_removals.contains(&reg.id));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registered.lock().expect("predicate list poisoned").len()
    }
}
