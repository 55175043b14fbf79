//! In-process block transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use sirocco_types::NodeId;
use tracing::warn;

use crate::group::{BlockFrame, BlockTransport, RbmGroup};
use crate::RbmError;

/// Connects dissemination group endpoints living in one address space.
/// Frames are delivered synchronously, preserving per-source order.
/// Frames for a group endpoint that has not registered yet (a member
/// still standing up the view) are held and replayed in order at
/// registration. Nodes can be cut to simulate crashes.
#[derive(Default)]
pub struct LoopbackTransport {
    endpoints: Mutex<HashMap<(NodeId, u64), Weak<RbmGroup>>>,
    pending: Mutex<HashMap<(NodeId, u64), Vec<BlockFrame>>>,
    cut: Mutex<Vec<NodeId>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `group` as `node`'s endpoint for the group's id and
    /// replays any frames held for it.
    pub fn register(&self, node: NodeId, group: &Arc<RbmGroup>) {
        self.endpoints
            .lock()
            .expect("loopback registry poisoned")
            .insert((node, group.group_id()), Arc::downgrade(group));
        let held = self
            .pending
            .lock()
            .expect("loopback pending poisoned")
            .remove(&(node, group.group_id()))
            .unwrap_or_default();
        for frame in held {
            if let Err(e) = group.handle_frame(frame) {
                warn!(peer = %node, error = %e, "held frame replay failed");
            }
        }
    }

    /// Drops every endpoint registered for `node`.
    pub fn deregister_node(&self, node: NodeId) {
        self.endpoints
            .lock()
            .expect("loopback registry poisoned")
            .retain(|(n, _), _| *n != node);
    }

    /// Makes `node` unreachable.
    pub fn cut(&self, node: NodeId) {
        let mut cut = self.cut.lock().expect("loopback cut list poisoned");
        if !cut.contains(&node) {
            cut.push(node);
        }
        drop(cut);
        self.pending
            .lock()
            .expect("loopback pending poisoned")
            .retain(|(n, _), _| *n != node);
    }

    pub fn is_cut(&self, node: NodeId) -> bool {
        self.cut
            .lock()
            .expect("loopback cut list poisoned")
            .contains(&node)
    }
}

impl BlockTransport for LoopbackTransport {
    fn send_block(&self, to: NodeId, frame: BlockFrame) -> Result<(), RbmError> {
        if self.is_cut(to) {
            return Err(RbmError::Unreachable { node: to });
        }
        let endpoint = {
            let endpoints = self.endpoints.lock().expect("loopback registry poisoned");
            endpoints.get(&(to, frame.group_id)).and_then(Weak::upgrade)
        };
        match endpoint {
            Some(group) => group.handle_frame(frame),
            None => {
                // The member has not stood this view's endpoint up yet;
                // hold the frame for replay at registration.
                self.pending
                    .lock()
                    .expect("loopback pending poisoned")
                    .entry((to, frame.group_id))
                    .or_default()
                    .push(frame);
                Ok(())
            }
        }
    }
}
