//! # sirocco-sst: the shared state table
//!
//! The coordination substrate of the engine: a logically replicated
//! table with one row per view member and a fixed column schema. Each
//! process writes only its own row and reads every row; a row push
//! propagates the local row to all peers through an abstract
//! [`RowFabric`], a reliable remote write: the in-process
//! [`MemoryFabric`] here, a TCP fabric in the glue layer, or whatever
//! the deployment provides.
//!
//! Coordination happens through the predicate engine: callers register
//! predicates (pure functions over the table) paired with actions, and a
//! dedicated thread re-evaluates them after every observed row change.
//! All cross-row ordering is encoded in the predicates themselves:
//! writes to different rows carry no ordering guarantee, only writes to
//! a single row apply in the owner's program order.
//!
//! When a push to a peer fails, that peer's row is frozen from this
//! node's perspective: predicates skip it and the failure is reported
//! upward, where the view manager turns it into a suspicion.

mod fabric;
mod predicates;
mod row;
mod table;

pub use fabric::{FabricError, MemoryFabric, RowFabric, RowUpdate};
pub use predicates::{PredicateHandle, PredicateKind};
pub use row::{SstRow, SstSchema};
pub use table::{ApplyOutcome, Sst};

/// Errors from shared state table operations.
#[derive(Debug, thiserror::Error)]
pub enum SstError {
    #[error("row update from {origin} does not match any member of this table")]
    UnknownOrigin { origin: sirocco_types::NodeId },

    #[error("row serialization failed: {0}")]
    Codec(#[from] postcard::Error),

    #[error(transparent)]
    Fabric(#[from] FabricError),
}
