//! The row fabric: an abstract reliable remote write.
//!
//! The table itself does not know how rows move between processes. A
//! [`RowFabric`] implementation provides one operation, delivering a
//! serialized row update to one peer reliably and in FIFO order, and
//! reports failure when a peer is unreachable. The engine's
//! deployment glue provides a TCP fabric; tests and single-process
//! simulations use [`MemoryFabric`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use sirocco_types::NodeId;

use crate::table::Sst;

/// One pushed row, as it crosses the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowUpdate {
    /// The owner of the row.
    pub origin: NodeId,
    /// False when the push elided the small-message slot region; the
    /// receiver keeps its previous slot bytes in that case.
    pub include_slots: bool,
    /// Postcard-serialized [`crate::SstRow`].
    pub row_bytes: Vec<u8>,
}

/// Errors a fabric push can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FabricError {
    #[error("peer {node} is unreachable")]
    Unreachable { node: NodeId },

    #[error("fabric transport failed: {reason}")]
    Transport { reason: String },
}

/// Reliable remote write of row updates.
///
/// Implementations must deliver updates to one peer in the order they
/// were pushed. Delivery to distinct peers is unordered.
pub trait RowFabric: Send + Sync {
    fn push_row(&self, to: NodeId, update: RowUpdate) -> Result<(), FabricError>;
}

// ============================================================================
// In-process fabric
// ============================================================================

/// An in-process fabric connecting tables that live in one address
/// space. Pushes apply synchronously into the destination table, which
/// trivially preserves per-origin FIFO order.
///
/// Two asynchronies of a real deployment are modeled:
/// - A node whose table is not bound yet (booting, or mid view change)
///   has its updates held and replayed in order when the table binds.
///   Updates a table reports as belonging to a future view are held the
///   same way.
/// - A *cut* node (crash simulation) fails pushes with
///   [`FabricError::Unreachable`], which the pushing table turns into a
///   frozen row and a failure report.
#[derive(Default)]
pub struct MemoryFabric {
    tables: Mutex<HashMap<NodeId, Weak<Sst>>>,
    pending: Mutex<HashMap<NodeId, Vec<RowUpdate>>>,
    cut: Mutex<Vec<NodeId>>,
}

impl MemoryFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Binds `table` as the endpoint for `node` and replays any held
    /// updates against it.
    pub fn register(&self, node: NodeId, table: &Arc<Sst>) {
        self.tables
            .lock()
            .expect("fabric registry poisoned")
            .insert(node, Arc::downgrade(table));
        let held = self
            .pending
            .lock()
            .expect("fabric pending poisoned")
            .remove(&node)
            .unwrap_or_default();
        for update in held {
            let _ = self.push_row(node, update);
        }
    }

    pub fn deregister(&self, node: NodeId) {
        self.tables
            .lock()
            .expect("fabric registry poisoned")
            .remove(&node);
    }

    /// Makes `node` unreachable, as a crashed process would be.
    pub fn cut(&self, node: NodeId) {
        let mut cut = self.cut.lock().expect("fabric cut list poisoned");
        if !cut.contains(&node) {
            cut.push(node);
        }
        self.pending
            .lock()
            .expect("fabric pending poisoned")
            .remove(&node);
    }

    pub fn is_cut(&self, node: NodeId) -> bool {
        self.cut
            .lock()
            .expect("fabric cut list poisoned")
            .contains(&node)
    }

    fn hold(&self, node: NodeId, update: RowUpdate) {
        self.pending
            .lock()
            .expect("fabric pending poisoned")
            .entry(node)
            .or_default()
            .push(update);
    }
}

impl RowFabric for MemoryFabric {
    fn push_row(&self, to: NodeId, update: RowUpdate) -> Result<(), FabricError> {
        if self.is_cut(to) || self.is_cut(update.origin) {
            return Err(FabricError::Unreachable { node: to });
        }
        let target = {
            let tables = self.tables.lock().expect("fabric registry poisoned");
            tables.get(&to).and_then(Weak::upgrade)
        };
        match target {
            Some(table) => match table.apply_remote(update.clone()) {
                Ok(crate::table::ApplyOutcome::FutureView) => {
                    // The destination has not installed that view yet;
                    // replay once its next table binds.
                    self.hold(to, update);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(FabricError::Transport {
                    reason: e.to_string(),
                }),
            },
            None => {
                self.hold(to, update);
                Ok(())
            }
        }
    }
}
