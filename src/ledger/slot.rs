//! Height slots
//!
//! One slot per block height: the forks seen at that height, which of them is
//! canonical, and when each peer reported.

use serde::Serialize;

use crate::types::{Block, BlockNumber, Millis, PeerId};

/// One peer's report at a given height
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationEntry {
    pub node: PeerId,
    pub trusted: bool,
    /// Index into the slot's forks
    pub fork: usize,
    pub received: Millis,
    pub propagation: Millis,
}

/// Ledger entry for one block height
#[derive(Debug, Clone, Serialize)]
pub struct HeightSlot {
    pub height: BlockNumber,
    /// Index of the canonical fork
    pub(crate) canonical: usize,
    pub(crate) forks: Vec<Block>,
    pub(crate) propagation: Vec<PropagationEntry>,
}

impl HeightSlot {
    /// Seed a slot with its first fork and first reporter
    pub(crate) fn seed(mut block: Block, node: &str, trusted: bool, received: Millis) -> Self {
        block.fork = Some(0);
        let entry = PropagationEntry {
            node: node.to_string(),
            trusted,
            fork: 0,
            received,
            propagation: block.propagation,
        };

        Self {
            height: block.number,
            canonical: 0,
            forks: vec![block],
            propagation: vec![entry],
        }
    }

    /// The current best display candidate for this height
    pub fn canonical(&self) -> &Block {
        &self.forks[self.canonical]
    }

    pub fn propagation_entries(&self) -> &[PropagationEntry] {
        &self.propagation
    }

    /// Index of the fork structurally matching `block`
    pub fn find_fork(&self, block: &Block) -> Option<usize> {
        self.forks.iter().position(|fork| fork.same_fork(block))
    }

    /// Index of the propagation entry recorded for `node`
    pub fn find_entry(&self, node: &str) -> Option<usize> {
        self.propagation.iter().position(|entry| entry.node == node)
    }

    pub fn entry_for(&self, node: &str) -> Option<&PropagationEntry> {
        self.propagation.iter().find(|entry| entry.node == node)
    }

    /// Append a new fork and return its index
    pub(crate) fn push_fork(&mut self, mut block: Block) -> usize {
        let index = self.forks.len();
        block.fork = Some(index);
        self.forks.push(block);
        index
    }
}
