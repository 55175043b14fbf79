//! Block transfer schedules.
//!
//! A schedule is a list of transfers `(from, to, block)` over member
//! positions `0..num_members`, with position 0 always the sender.
//! Transfers are grouped into rounds; within a round each member
//! performs its transfers sequentially, and a member only relays a
//! block in a round after the round that delivered it. The scheduling
//! algorithms trade sender fan-out against latency:
//!
//! - **Sequential**: the sender pushes every block to every receiver
//!   itself. No relaying; lowest coordination, highest sender load.
//! - **Chain**: blocks flow down the member chain one hop per round,
//!   pipelined, so steady-state throughput is one block per round.
//! - **Tree**: blocks fan out along a binary tree rooted at the sender,
//!   level-synchronous per block.
//! - **Binomial**: the holder set of each block doubles every round,
//!   and consecutive blocks are pipelined one round apart.

use sirocco_types::SendAlgorithm;

/// One scheduled block copy between two member positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: u32,
    pub to: u32,
    pub block: u32,
}

/// Computes the transfer schedule for disseminating `num_blocks` blocks
/// among `num_members` members (position 0 = sender), as rounds of
/// transfers.
///
/// For a single-member group the schedule is empty: the sender already
/// holds everything.
pub fn schedule(
    algorithm: SendAlgorithm,
    num_members: u32,
    num_blocks: u32,
) -> Vec<Vec<Transfer>> {
    if num_members <= 1 || num_blocks == 0 {
        return Vec::new();
    }
    match algorithm {
        SendAlgorithm::Sequential => sequential(num_members, num_blocks),
        SendAlgorithm::Chain => chain(num_members, num_blocks),
        SendAlgorithm::Tree => tree(num_members, num_blocks),
        SendAlgorithm::Binomial => binomial(num_members, num_blocks),
    }
}

fn sequential(num_members: u32, num_blocks: u32) -> Vec<Vec<Transfer>> {
    let mut rounds = Vec::with_capacity(num_blocks as usize);
    for block in 0..num_blocks {
        let round = (1..num_members)
            .map(|to| Transfer { from: 0, to, block })
            .collect();
        rounds.push(round);
    }
    rounds
}

fn chain(num_members: u32, num_blocks: u32) -> Vec<Vec<Transfer>> {
    // Member i relays block b in round b + i; the pipeline drains after
    // num_blocks + num_members - 2 rounds.
    let total_rounds = num_blocks + num_members - 2;
    let mut rounds = vec![Vec::new(); total_rounds as usize];
    for block in 0..num_blocks {
        for from in 0..num_members - 1 {
            rounds[(block + from) as usize].push(Transfer {
                from,
                to: from + 1,
                block,
            });
        }
    }
    rounds
}

fn tree(num_members: u32, num_blocks: u32) -> Vec<Vec<Transfer>> {
    // Binary heap shape: position p forwards to 2p+1 and 2p+2. Levels
    // of consecutive blocks are pipelined one round apart.
    let depth = {
        let mut d = 0;
        while (1u32 << d) < num_members {
            d += 1;
        }
        d.max(1)
    };
    let mut rounds: Vec<Vec<Transfer>> = vec![Vec::new(); (num_blocks + depth - 1) as usize];
    for block in 0..num_blocks {
        for from in 0..num_members {
            let level = (from + 1).ilog2();
            for child in [2 * from + 1, 2 * from + 2] {
                if child < num_members {
                    rounds[(block + level) as usize].push(Transfer {
                        from,
                        to: child,
                        block,
                    });
                }
            }
        }
    }
    rounds.retain(|r| !r.is_empty());
    rounds
}

fn binomial(num_members: u32, num_blocks: u32) -> Vec<Vec<Transfer>> {
    // Per block, the holder set doubles each relative round: a holder at
    // position p sends to p + 2^r while that lands inside the group.
    // Blocks are pipelined one absolute round apart.
    let doubling_rounds = {
        let mut r = 0;
        while (1u32 << r) < num_members {
            r += 1;
        }
        r
    };
    let mut rounds: Vec<Vec<Transfer>> =
        vec![Vec::new(); (num_blocks + doubling_rounds - 1) as usize];
    for block in 0..num_blocks {
        for r in 0..doubling_rounds {
            let stride = 1u32 << r;
            for from in 0..stride.min(num_members) {
                let to = from + stride;
                if to < num_members {
                    rounds[(block + r) as usize].push(Transfer { from, to, block });
                }
            }
        }
    }
    rounds
}
