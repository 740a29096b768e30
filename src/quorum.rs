//! Quorum tracking: given a cluster size, decide when enough peers have
//! granted or refused a round to conclude it.

use crate::types::NodeId;
use std::collections::HashSet;

/// Current disposition of a quorum-tracked round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumState {
    Pending,
    Pass,
    Refuse,
}

/// Counts grants and refusals from distinct peers against a majority
/// threshold computed from the cluster size `n`. Duplicate responses from
/// the same peer are folded (idempotent `grant`/`refuse`).
#[derive(Clone, Debug)]
pub struct QuorumTracker {
    total: usize,
    threshold: usize,
    granted: HashSet<NodeId>,
    refused: HashSet<NodeId>,
}

/// `⌊n/2⌋ + 1` — a strict majority of `n` members.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

impl QuorumTracker {
    pub fn new(total: usize) -> QuorumTracker {
        QuorumTracker {
            total,
            threshold: majority(total),
            granted: HashSet::new(),
            refused: HashSet::new(),
        }
    }

    pub fn grant(&mut self, peer: NodeId) -> QuorumState {
        self.refused.remove(&peer);
        self.granted.insert(peer);
        self.state()
    }

    pub fn refuse(&mut self, peer: NodeId) -> QuorumState {
        self.granted.remove(&peer);
        self.refused.insert(peer);
        self.state()
    }

    pub fn state(&self) -> QuorumState {
        if self.granted.len() >= self.threshold {
            QuorumState::Pass
        } else if self.refused.len() >= self.total - self.threshold + 1 {
            QuorumState::Refuse
        } else {
            QuorumState::Pending
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
