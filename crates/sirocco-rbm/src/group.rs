//! Dissemination groups.
//!
//! One [`RbmGroup`] endpoint exists per member per (shard, sender)
//! pair. The member at position 0 of the group is the sender; everyone
//! else receives, and (depending on the schedule) relays blocks
//! onward. Completed messages are handed to the completion callback in
//! the sender's send order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sirocco_types::{NodeId, SendAlgorithm};
use tracing::warn;

use crate::schedule::{schedule, Transfer};
use crate::RbmError;

/// One block of one message, as it crosses the transport.
#[derive(Debug, Clone)]
pub struct BlockFrame {
    pub group_id: u64,
    /// The sender's per-group message counter.
    pub msg_seq: u64,
    pub block: u32,
    pub num_blocks: u32,
    pub total_size: u64,
    pub payload: Bytes,
}

/// Abstract reliable remote write of one block.
///
/// Implementations must deliver frames to one destination in the order
/// they were sent from one source.
pub trait BlockTransport: Send + Sync {
    fn send_block(&self, to: NodeId, frame: BlockFrame) -> Result<(), RbmError>;
}

/// Invoked with `(sender, size, payload)` for each completed message,
/// in per-sender send order.
pub type CompletionCallback = Box<dyn Fn(NodeId, usize, Bytes) + Send + Sync>;

struct Partial {
    num_blocks: u32,
    total_size: u64,
    received: Vec<bool>,
    num_received: u32,
    buffer: Vec<u8>,
}

struct GroupState {
    /// Sender side: next message sequence to assign.
    send_seq: u64,
    /// Receiver side: next message sequence to deliver.
    next_deliver: u64,
    /// Messages mid-reassembly, by sequence.
    partial: BTreeMap<u64, Partial>,
    /// Reassembled but not yet deliverable (a predecessor is missing).
    completed: BTreeMap<u64, (usize, Bytes)>,
}

/// One member's endpoint in a dissemination group.
pub struct RbmGroup {
    group_id: u64,
    /// Group order; position 0 is the sender.
    members: Vec<NodeId>,
    my_position: u32,
    block_size: usize,
    algorithm: SendAlgorithm,
    transport: Arc<dyn BlockTransport>,
    state: Mutex<GroupState>,
    completion: CompletionCallback,
}

impl RbmGroup {
    pub fn new(
        group_id: u64,
        members: Vec<NodeId>,
        me: NodeId,
        block_size: usize,
        algorithm: SendAlgorithm,
        transport: Arc<dyn BlockTransport>,
        completion: CompletionCallback,
    ) -> Result<Arc<Self>, RbmError> {
        let my_position = members
            .iter()
            .position(|m| *m == me)
            .ok_or(RbmError::UnknownGroup { group_id })? as u32;
        Ok(Arc::new(Self {
            group_id,
            members,
            my_position,
            block_size,
            algorithm,
            transport,
            state: Mutex::new(GroupState {
                send_seq: 0,
                next_deliver: 0,
                partial: BTreeMap::new(),
                completed: BTreeMap::new(),
            }),
            completion,
        }))
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn sender(&self) -> NodeId {
        self.members[0]
    }

    pub fn is_sender(&self) -> bool {
        self.my_position == 0
    }

    /// Multicasts one payload to the group. Only the group's sender may
    /// call this; blocks are pushed according to the group's schedule
    /// and relayed by the receivers it targets.
    pub fn send(&self, payload: Bytes) -> Result<(), RbmError> {
        if !self.is_sender() {
            return Err(RbmError::NotSender {
                group_id: self.group_id,
            });
        }
        if payload.is_empty() {
            return Err(RbmError::EmptyPayload);
        }
        let num_blocks = payload.len().div_ceil(self.block_size) as u32;
        let msg_seq = {
            let mut state = self.state.lock().expect("rbm state poisoned");
            let seq = state.send_seq;
            state.send_seq += 1;
            seq
        };

        let rounds = schedule(self.algorithm, self.members.len() as u32, num_blocks);
        for round in &rounds {
            for transfer in round.iter().filter(|t| t.from == 0) {
                let frame = self.frame_for(&payload, msg_seq, num_blocks, transfer.block);
                self.transport
                    .send_block(self.members[transfer.to as usize], frame)?;
            }
        }
        Ok(())
    }

    fn frame_for(&self, payload: &Bytes, msg_seq: u64, num_blocks: u32, block: u32) -> BlockFrame {
        let start = block as usize * self.block_size;
        let end = (start + self.block_size).min(payload.len());
        BlockFrame {
            group_id: self.group_id,
            msg_seq,
            block,
            num_blocks,
            total_size: payload.len() as u64,
            payload: payload.slice(start..end),
        }
    }

    /// Handles one inbound block: relays it onward per the schedule,
    /// buffers it, and delivers any newly completed messages in order.
    pub fn handle_frame(&self, frame: BlockFrame) -> Result<(), RbmError> {
        if frame.group_id != self.group_id {
            return Err(RbmError::UnknownGroup {
                group_id: frame.group_id,
            });
        }
        self.relay(&frame);
        let deliverable = self.buffer_frame(frame)?;
        for (size, payload) in deliverable {
            (self.completion)(self.sender(), size, payload);
        }
        Ok(())
    }

    /// Forwards the block to any members this position is scheduled to
    /// serve. Relay failures are not this layer's problem: the failure
    /// detector owns peer death, so they are logged and skipped.
    fn relay(&self, frame: &BlockFrame) {
        let rounds = schedule(
            self.algorithm,
            self.members.len() as u32,
            frame.num_blocks,
        );
        let my_transfers = rounds
            .iter()
            .flatten()
            .filter(|t: &&Transfer| t.from == self.my_position && t.block == frame.block);
        for transfer in my_transfers {
            let to = self.members[transfer.to as usize];
            if let Err(e) = self.transport.send_block(to, frame.clone()) {
                warn!(
                    group = self.group_id,
                    block = frame.block,
                    peer = %to,
                    error = %e,
                    "block relay failed"
                );
            }
        }
    }

    fn buffer_frame(&self, frame: BlockFrame) -> Result<Vec<(usize, Bytes)>, RbmError> {
        let mut state = self.state.lock().expect("rbm state poisoned");
        if frame.msg_seq < state.next_deliver {
            // Late duplicate of an already-delivered message.
            return Ok(Vec::new());
        }

        let block_size = self.block_size;
        let partial = state.partial.entry(frame.msg_seq).or_insert_with(|| Partial {
            num_blocks: frame.num_blocks,
            total_size: frame.total_size,
            received: vec![false; frame.num_blocks as usize],
            num_received: 0,
            buffer: vec![0; frame.total_size as usize],
        });
        if partial.num_blocks != frame.num_blocks || partial.total_size != frame.total_size {
            return Err(RbmError::InconsistentFrame {
                group_id: self.group_id,
                msg_seq: frame.msg_seq,
                reason: "message geometry changed between blocks",
            });
        }
        let idx = frame.block as usize;
        if idx >= partial.received.len() {
            return Err(RbmError::InconsistentFrame {
                group_id: self.group_id,
                msg_seq: frame.msg_seq,
                reason: "block index out of range",
            });
        }
        if !partial.received[idx] {
            partial.received[idx] = true;
            partial.num_received += 1;
            let start = idx * block_size;
            partial.buffer[start..start + frame.payload.len()]
                .copy_from_slice(&frame.payload);
        }

        if partial.num_received == partial.num_blocks {
            let done = state
                .partial
                .remove(&frame.msg_seq)
                .expect("partial entry just inserted");
            state
                .completed
                .insert(frame.msg_seq, (done.total_size as usize, Bytes::from(done.buffer)));
        }

        // Drain the in-order prefix of completed messages.
        let mut deliverable = Vec::new();
        loop {
            let next_deliver = state.next_deliver;
            let Some(message) = state.completed.remove(&next_deliver) else {
                break;
            };
            deliverable.push(message);
            state.next_deliver += 1;
        }
        Ok(deliverable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoopbackTransport;
    use std::sync::Mutex as StdMutex;

    fn build_group(
        algorithm: SendAlgorithm,
        block_size: usize,
        ids: &[u32],
    ) -> (Arc<LoopbackTransport>, Vec<Arc<RbmGroup>>, Arc<StdMutex<Vec<(u32, Vec<u8>)>>>) {
        let transport = LoopbackTransport::new();
        let members: Vec<NodeId> = ids.iter().copied().map(NodeId::new).collect();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let mut groups = Vec::new();
        for me in &members {
            let received = received.clone();
            let me_id = me.as_u32();
            let group = RbmGroup::new(
                7,
                members.clone(),
                *me,
                block_size,
                algorithm,
                transport.clone() as Arc<dyn BlockTransport>,
                Box::new(move |_sender, size, payload| {
                    received
                        .lock()
                        .unwrap()
                        .push((me_id, payload[..size].to_vec()));
                }),
            )
            .unwrap();
            transport.register(*me, &group);
            groups.push(group);
        }
        (transport, groups, received)
    }

    #[test]
    fn sequential_delivers_to_all_receivers() {
        let (_t, groups, received) = build_group(SendAlgorithm::Sequential, 8, &[1, 2, 3]);
        groups[0].send(Bytes::from_static(b"a 19-byte payload!!")).unwrap();

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 2);
        for (member, payload) in got.iter() {
            assert!(*member == 2 || *member == 3);
            assert_eq!(payload.as_slice(), b"a 19-byte payload!!");
        }
    }

    #[test]
    fn chain_relays_through_members() {
        // With chain dissemination only member 2 hears from the sender
        // directly; member 3 depends on 2's relay.
        let (_t, groups, received) = build_group(SendAlgorithm::Chain, 4, &[1, 2, 3]);
        let payload: Vec<u8> = (0u8..23).collect();
        groups[0].send(Bytes::from(payload.clone())).unwrap();

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().any(|(m, p)| *m == 3 && p == &payload));
    }

    #[test]
    fn messages_deliver_in_send_order() {
        let (_t, groups, received) = build_group(SendAlgorithm::Binomial, 16, &[1, 2, 3, 4]);
        for i in 0u8..5 {
            groups[0].send(Bytes::from(vec![i; 40])).unwrap();
        }
        let got = received.lock().unwrap();
        // Each of the 3 receivers sees 5 messages, in order.
        for member in [2u32, 3, 4] {
            let mine: Vec<&Vec<u8>> = got
                .iter()
                .filter(|(m, _)| *m == member)
                .map(|(_, p)| p)
                .collect();
            assert_eq!(mine.len(), 5);
            for (i, payload) in mine.iter().enumerate() {
                assert_eq!(payload.as_slice(), vec![i as u8; 40].as_slice());
            }
        }
    }

    #[test]
    fn only_the_sender_may_send() {
        let (_t, groups, _received) = build_group(SendAlgorithm::Sequential, 8, &[1, 2]);
        assert!(matches!(
            groups[1].send(Bytes::from_static(b"nope")),
            Err(RbmError::NotSender { .. })
        ));
    }

    #[test]
    fn unreachable_receiver_surfaces_on_send() {
        let (transport, groups, _received) = build_group(SendAlgorithm::Sequential, 8, &[1, 2, 3]);
        transport.cut(NodeId::new(2));
        assert!(matches!(
            groups[0].send(Bytes::from_static(b"payload")),
            Err(RbmError::Unreachable { .. })
        ));
    }

    #[test]
    fn geometry_change_is_rejected() {
        let (_t, groups, _received) = build_group(SendAlgorithm::Sequential, 8, &[1, 2]);
        let f1 = BlockFrame {
            group_id: 7,
            msg_seq: 0,
            block: 0,
            num_blocks: 2,
            total_size: 16,
            payload: Bytes::from_static(&[0; 8]),
        };
        let mut f2 = f1.clone();
        f2.block = 1;
        f2.num_blocks = 3;
        groups[1].handle_frame(f1).unwrap();
        assert!(matches!(
            groups[1].handle_frame(f2),
            Err(RbmError::InconsistentFrame { .. })
        ));
    }
}
