//! Block Ledger
//!
//! Bounded, height-indexed history of observed blocks. Each height keeps every
//! structurally distinct fork reported for it, which fork is canonical, and
//! per-peer propagation timing.
//!
//! ## Retention
//!
//! At most [`MAX_HISTORY`] heights are retained, always the highest known.
//! A new height is admitted only if the ledger is empty, the height is above
//! the lowest retained height, or the report is a backfill below the best
//! height while the ledger still has room.

mod slot;
pub mod stats;

pub use slot::{HeightSlot, PropagationEntry};

use serde::Serialize;
use tracing::{debug, trace};

use crate::types::{Block, BlockNumber, BlockReport, Millis};

/// Maximum number of retained heights
pub const MAX_HISTORY: usize = 2000;

/// Length of a peer's propagation window
pub const MAX_PEER_PROPAGATION: usize = 40;

/// Maximum heights requested in one backfill
pub const MAX_BACKFILL_REQUEST: usize = 50;

/// Sentinel for an unknown propagation value
pub const UNKNOWN_PROPAGATION: i64 = -1;

/// Result of an accepted (well-formed) submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// The incoming block, stamped with timing and fork metadata
    pub block: Block,
    /// Whether the ledger changed
    pub changed: bool,
}

/// Range of missing heights to ask a peer for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillRange {
    pub min: i64,
    pub max: BlockNumber,
    /// Up to 50 of the highest missing heights, ascending
    pub list: Vec<BlockNumber>,
}

/// Height-indexed block history
#[derive(Debug, Default)]
pub struct BlockLedger {
    /// Sorted by height, descending
    slots: Vec<HeightSlot>,
}

impl BlockLedger {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Record a block report from a peer
    ///
    /// Returns `None` when the report is malformed. An admission decline is
    /// not an error: it returns the stamped block with `changed == false`.
    pub fn submit(
        &mut self,
        report: &BlockReport,
        peer_id: &str,
        trusted: bool,
        is_backfill: bool,
        now: Millis,
    ) -> Option<Submission> {
        let mut block = report.validate()?;

        block.trusted = trusted;
        block.arrived = now;
        block.received = now;
        block.propagation = 0;
        block.fork = None;

        let best = self.best_height();
        let inter_block_time = self.inter_block_time(&block, best);

        let position = match self.position(block.number) {
            Ok(position) => position,
            Err(insert_at) => {
                return Some(self.open_slot(block, insert_at, peer_id, trusted, is_backfill, inter_block_time, now));
            }
        };

        let slot = &mut self.slots[position];
        let entry_index = slot.find_entry(peer_id);
        let matched = slot.find_fork(&block);
        let mut changed = true;

        let fork_index = match (entry_index, matched) {
            (None, Some(fork)) => {
                block.arrived = slot.forks[fork].arrived;
                block.time = slot.forks[fork].time;
                block.propagation = now.saturating_sub(slot.forks[fork].received);
                slot.propagation.push(PropagationEntry {
                    node: peer_id.to_string(),
                    trusted,
                    fork,
                    received: now,
                    propagation: block.propagation,
                });
                fork
            }
            (None, None) => {
                block.time = inter_block_time;
                let fork = slot.push_fork(block.clone());
                slot.propagation.push(PropagationEntry {
                    node: peer_id.to_string(),
                    trusted,
                    fork,
                    received: now,
                    propagation: block.propagation,
                });
                fork
            }
            (Some(entry), Some(fork)) => {
                block.arrived = slot.forks[fork].arrived;
                block.time = slot.forks[fork].time;
                let entry = &mut slot.propagation[entry];

                if entry.fork == fork {
                    block.received = entry.received;
                    block.propagation = entry.propagation;
                    changed = false;
                } else {
                    block.propagation = now.saturating_sub(slot.forks[fork].received);
                    entry.fork = fork;
                    entry.propagation = block.propagation;
                }
                fork
            }
            (Some(entry), None) => {
                block.received = slot.propagation[entry].received;
                block.propagation = slot.propagation[entry].propagation;
                block.time = inter_block_time;
                let fork = slot.push_fork(block.clone());
                slot.propagation[entry].fork = fork;
                fork
            }
        };

        if trusted && !slot.canonical().same_fork(&slot.forks[fork_index]) {
            slot.forks[fork_index].trusted = true;
            slot.canonical = fork_index;
            changed = true;
            debug!("Promoted fork {} to canonical at height {}", fork_index, slot.height);
        }

        block.fork = Some(fork_index);

        Some(Submission { block, changed })
    }

    /// Create a slot for a height not yet retained, if admission allows it
    #[allow(clippy::too_many_arguments)]
    fn open_slot(
        &mut self,
        mut block: Block,
        insert_at: usize,
        peer_id: &str,
        trusted: bool,
        is_backfill: bool,
        inter_block_time: Millis,
        now: Millis,
    ) -> Submission {
        block.time = inter_block_time;

        if !self.admits(block.number, is_backfill) {
            trace!(
                "Declined height {} (worst={}, best={}, backfill={})",
                block.number,
                self.worst_height(),
                self.best_height(),
                is_backfill
            );
            return Submission { block, changed: false };
        }

        block.fork = Some(0);
        self.slots
            .insert(insert_at, HeightSlot::seed(block.clone(), peer_id, trusted, now));

        if self.slots.len() > MAX_HISTORY {
            if let Some(dropped) = self.slots.pop() {
                trace!("History window full, dropped height {}", dropped.height);
            }
        }

        Submission { block, changed: true }
    }

    /// Admission rule for a brand-new height
    fn admits(&self, number: BlockNumber, is_backfill: bool) -> bool {
        self.slots.is_empty()
            || number > self.worst_height()
            || (self.slots.len() < MAX_HISTORY && number < self.best_height() && is_backfill)
    }

    /// Milliseconds since the nearest lower retained height
    ///
    /// Live blocks are timed by arrival; blocks below the best height (history)
    /// use on-chain timestamps since their arrival order means nothing.
    fn inter_block_time(&self, block: &Block, best: BlockNumber) -> Millis {
        let Some(prev) = self.slots.iter().find(|slot| slot.height < block.number) else {
            return 0;
        };
        let prev = prev.canonical();

        if block.number < best {
            block.timestamp.saturating_sub(prev.timestamp).saturating_mul(1000)
        } else {
            block.arrived.saturating_sub(prev.arrived)
        }
    }

    /// `Ok(index)` of the slot at `number`, or `Err(insert position)`
    fn position(&self, number: BlockNumber) -> Result<usize, usize> {
        self.slots.binary_search_by(|slot| number.cmp(&slot.height))
    }

    #[cfg(test)]
    pub fn get(&self, number: BlockNumber) -> Option<&HeightSlot> {
        self.position(number).ok().map(|index| &self.slots[index])
    }

    /// Retained slots, highest first
    pub fn slots(&self) -> impl Iterator<Item = &HeightSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The highest retained slot
    pub fn best(&self) -> Option<&HeightSlot> {
        self.slots.first()
    }

    pub fn best_height(&self) -> BlockNumber {
        self.slots.first().map(|slot| slot.height).unwrap_or(0)
    }

    pub fn worst_height(&self) -> BlockNumber {
        self.slots.last().map(|slot| slot.height).unwrap_or(0)
    }

    /// Whether the ledger still has room to grow
    pub fn has_room(&self) -> bool {
        self.slots.len() < MAX_HISTORY
    }

    /// Propagation window for one peer over the 40 highest retained heights
    ///
    /// Index `39 - (best - height)`; heights whose index would be negative are
    /// skipped. Where the peer did not report, the delay is synthesised from
    /// the arrival of the most recent height it did report (or `now`).
    pub fn peer_propagation_vector(&self, peer_id: &str, now: Millis) -> Vec<i64> {
        let mut window = vec![UNKNOWN_PROPAGATION; MAX_PEER_PROPAGATION];
        let best = self.best_height() as i64;
        let mut last_arrival = now;

        for slot in self.slots.iter().take(MAX_PEER_PROPAGATION) {
            let index = MAX_PEER_PROPAGATION as i64 - 1 - best + slot.height as i64;
            if index < 0 {
                continue;
            }
            let index = index as usize;
            let arrived = slot.canonical().arrived;

            match slot.entry_for(peer_id) {
                Some(entry) => {
                    window[index] = entry.propagation as i64;
                    last_arrival = arrived;
                }
                None => {
                    window[index] = last_arrival.saturating_sub(arrived) as i64;
                }
            }
        }

        window
    }

    /// Missing heights below the best one, for a backfill request
    ///
    /// `None` when fewer than two heights are retained or nothing is missing.
    pub fn backfill_range(&self) -> Option<BackfillRange> {
        if self.slots.len() < 2 {
            return None;
        }

        let best = self.best_height();
        let lowest = best.saturating_sub(MAX_HISTORY as u64);
        let missing: Vec<BlockNumber> = (lowest..=best)
            .filter(|height| self.position(*height).is_err())
            .collect();

        let max = *missing.last()?;
        let span = MAX_BACKFILL_REQUEST.min(MAX_HISTORY - self.slots.len() + 1) as i64;
        let min = max as i64 - span + 1;
        let list = missing[missing.len().saturating_sub(MAX_BACKFILL_REQUEST)..].to_vec();

        Some(BackfillRange { min, max, list })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_malformed_block_rejected() {
        let mut ledger = BlockLedger::new();
        let mut report = create_test_block(10, "0xa");
        report.uncles = None;

        assert!(ledger.submit(&report, "a", true, false, 1_000).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_trusted_fork_stays_canonical_against_untrusted() {
        let mut ledger = BlockLedger::new();

        ledger.submit(&create_test_block(100, "0xa"), "peer-a", true, false, 1_000).unwrap();
        let result = ledger
            .submit(&create_test_block(100, "0xb"), "peer-b", false, false, 1_200)
            .unwrap();

        let slot = ledger.get(100).unwrap();
        assert_eq!(slot.forks.len(), 2);
        assert_eq!(slot.canonical().hash, "0xa");
        assert_eq!(result.block.fork, Some(1));
        assert!(result.changed);
    }

    #[test]
    fn test_trusted_report_promotes_fork() {
        let mut ledger = BlockLedger::new();

        ledger.submit(&create_test_block(100, "0xa"), "peer-a", false, false, 1_000).unwrap();
        ledger.submit(&create_test_block(100, "0xb"), "peer-b", true, false, 1_100).unwrap();

        let slot = ledger.get(100).unwrap();
        assert_eq!(slot.canonical().hash, "0xb");
        assert!(slot.canonical().trusted);

        // Untrusted reports of the old fork never demote
        ledger.submit(&create_test_block(100, "0xa"), "peer-c", false, false, 1_200).unwrap();
        assert_eq!(ledger.get(100).unwrap().canonical().hash, "0xb");
    }

    #[test]
    fn test_same_content_from_two_peers_shares_fork() {
        let mut ledger = BlockLedger::new();

        let first = ledger.submit(&create_test_block(50, "0xa"), "peer-a", false, false, 1_000).unwrap();
        let second = ledger.submit(&create_test_block(50, "0xa"), "peer-b", false, false, 1_350).unwrap();

        assert_eq!(first.block.fork, second.block.fork);
        assert_eq!(second.block.propagation, 350);
        assert_eq!(second.block.arrived, 1_000);

        let slot = ledger.get(50).unwrap();
        assert_eq!(slot.forks.len(), 1);
        assert_eq!(slot.propagation_entries().len(), 2);
        assert_eq!(slot.entry_for("peer-b").unwrap().propagation, 350);
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let mut ledger = BlockLedger::new();
        let report = create_test_block(70, "0xa");

        ledger.submit(&report, "peer-a", false, false, 1_000).unwrap();
        ledger.submit(&report, "peer-b", false, false, 1_400).unwrap();
        let again = ledger.submit(&report, "peer-b", false, false, 9_000).unwrap();

        assert!(!again.changed);
        assert_eq!(again.block.propagation, 400);
        assert_eq!(again.block.received, 1_400);

        let slot = ledger.get(70).unwrap();
        assert_eq!(slot.forks.len(), 1);
        assert_eq!(slot.propagation_entries().len(), 2);
    }

    #[test]
    fn test_repeat_report_switching_fork_updates_entry() {
        let mut ledger = BlockLedger::new();

        ledger.submit(&create_test_block(80, "0xa"), "peer-a", false, false, 1_000).unwrap();
        ledger.submit(&create_test_block(80, "0xb"), "peer-b", false, false, 1_100).unwrap();

        // peer-a now claims fork 0xb, which first arrived at 1_100
        let switched = ledger.submit(&create_test_block(80, "0xb"), "peer-a", false, false, 1_600).unwrap();
        assert!(switched.changed);
        assert_eq!(switched.block.fork, Some(1));

        let entry = ledger.get(80).unwrap().entry_for("peer-a").unwrap().clone();
        assert_eq!(entry.fork, 1);
        assert_eq!(entry.propagation, 500);
    }

    #[test]
    fn test_repeat_report_with_unseen_fork_adds_fork() {
        let mut ledger = BlockLedger::new();

        ledger.submit(&create_test_block(90, "0xa"), "peer-a", false, false, 1_000).unwrap();
        let result = ledger.submit(&create_test_block(90, "0xc"), "peer-a", false, false, 2_000).unwrap();

        let slot = ledger.get(90).unwrap();
        assert_eq!(slot.forks.len(), 2);
        assert_eq!(slot.propagation_entries().len(), 1);
        assert_eq!(slot.entry_for("peer-a").unwrap().fork, 1);
        assert_eq!(result.block.received, 1_000);
    }

    #[test]
    fn test_window_keeps_highest_heights() {
        let mut ledger = BlockLedger::new();

        for height in 1..=2001u64 {
            ledger
                .submit(&create_test_block(height, &format!("0x{:x}", height)), "peer-a", true, false, height * 1_000)
                .unwrap();
        }

        assert_eq!(ledger.len(), MAX_HISTORY);
        assert_eq!(ledger.best_height(), 2001);
        assert_eq!(ledger.worst_height(), 2);
        assert!(ledger.get(1).is_none());
    }

    #[test]
    fn test_admission_rule() {
        let mut ledger = BlockLedger::new();
        ledger.submit(&create_test_block(10, "0xa"), "p", false, false, 1_000).unwrap();
        ledger.submit(&create_test_block(20, "0xb"), "p", false, false, 2_000).unwrap();

        // Below the worst height, not backfill: declined
        let declined = ledger.submit(&create_test_block(5, "0xc"), "p", false, false, 3_000).unwrap();
        assert!(!declined.changed);
        assert!(ledger.get(5).is_none());

        // Above the worst height: admitted even though below best
        assert!(ledger.submit(&create_test_block(15, "0xd"), "p", false, false, 3_000).unwrap().changed);

        // Explicit backfill below the worst height with room to grow: admitted
        assert!(ledger.submit(&create_test_block(5, "0xc"), "p", false, true, 3_000).unwrap().changed);
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.worst_height(), 5);
    }

    #[test]
    fn test_full_ledger_declines_backfill_below_worst() {
        let mut ledger = BlockLedger::new();
        for height in (11..=2011u64).filter(|h| *h != 1_000) {
            ledger
                .submit(&create_test_block(height, &format!("0x{:x}", height)), "p", true, false, height)
                .unwrap();
        }
        assert_eq!(ledger.len(), MAX_HISTORY);
        assert_eq!(ledger.worst_height(), 11);

        // No room to grow: history below the window is declined
        let declined = ledger.submit(&create_test_block(5, "0x5"), "p", true, true, 5_000).unwrap();
        assert!(!declined.changed);
        assert!(ledger.get(5).is_none());
        assert_eq!(ledger.len(), MAX_HISTORY);

        // A gap inside the window still fills, pushing out the lowest height
        assert!(ledger.submit(&create_test_block(1_000, "0x3e8"), "p", true, true, 5_000).unwrap().changed);
        assert_eq!(ledger.len(), MAX_HISTORY);
        assert_eq!(ledger.worst_height(), 12);
        assert!(ledger.get(1_000).is_some());
    }

    #[test]
    fn test_live_block_time_uses_arrival() {
        let mut ledger = BlockLedger::new();
        ledger.submit(&create_test_block(1, "0x1"), "p", true, false, 10_000).unwrap();
        let second = ledger.submit(&create_test_block(2, "0x2"), "p", true, false, 24_500).unwrap();

        assert_eq!(second.block.time, 14_500);
        assert_eq!(ledger.get(1).unwrap().canonical().time, 0);
    }

    #[test]
    fn test_history_block_time_uses_timestamps() {
        let mut ledger = BlockLedger::new();
        ledger.submit(&create_test_block(1, "0x1"), "p", true, false, 10_000).unwrap();
        ledger.submit(&create_test_block(10, "0xa"), "p", true, false, 20_000).unwrap();

        // Height 5 is below best: timed by on-chain timestamps (15s apart per block)
        let backfilled = ledger.submit(&create_test_block(5, "0x5"), "p", true, true, 30_000).unwrap();
        assert_eq!(backfilled.block.time, (5 - 1) * 15 * 1_000);
    }

    #[test]
    fn test_propagation_vector_shape() {
        let mut ledger = BlockLedger::new();
        for height in 1..=50u64 {
            ledger
                .submit(&create_test_block(height, &format!("0x{:x}", height)), "peer-a", true, false, height * 1_000)
                .unwrap();
        }
        ledger.submit(&create_test_block(50, "0x32"), "peer-b", false, false, 50_300).unwrap();

        let window = ledger.peer_propagation_vector("peer-b", 60_000);
        assert_eq!(window.len(), MAX_PEER_PROPAGATION);
        assert!(window.iter().all(|v| *v == UNKNOWN_PROPAGATION || *v >= 0));
        // Best height maps to the last index
        assert_eq!(window[39], 300);
        // Lower heights are synthesised from the last real arrival (50_000)
        assert_eq!(window[38], 1_000);
        assert_eq!(window[0], 39_000);

        let own = ledger.peer_propagation_vector("peer-a", 60_000);
        assert!(own.iter().all(|v| *v == 0));
    }

    #[test]
    fn test_propagation_vector_skips_heights_outside_window() {
        let mut ledger = BlockLedger::new();
        ledger.submit(&create_test_block(10, "0xa"), "peer-a", true, false, 1_000).unwrap();
        ledger.submit(&create_test_block(100, "0xb"), "peer-a", true, false, 2_000).unwrap();

        let window = ledger.peer_propagation_vector("peer-a", 3_000);
        assert_eq!(window[39], 0);
        assert_eq!(window.iter().filter(|v| **v == UNKNOWN_PROPAGATION).count(), 39);

        let empty = BlockLedger::new().peer_propagation_vector("peer-a", 3_000);
        assert!(empty.iter().all(|v| *v == UNKNOWN_PROPAGATION));
    }

    #[test]
    fn test_backfill_range_with_gap() {
        let mut ledger = BlockLedger::new();
        ledger.submit(&create_test_block(498, "0xa"), "p", true, false, 1_000).unwrap();
        ledger.submit(&create_test_block(500, "0xb"), "p", true, false, 2_000).unwrap();

        let range = ledger.backfill_range().unwrap();
        assert_eq!(range.max, 499);
        assert_eq!(range.min, 450);
        assert_eq!(range.list.len(), MAX_BACKFILL_REQUEST);
        assert_eq!(range.list.last(), Some(&499));
        assert_eq!(range.list.first(), Some(&449));
        assert!(!range.list.contains(&498));
    }

    #[test]
    fn test_backfill_range_needs_two_slots() {
        let mut ledger = BlockLedger::new();
        assert!(ledger.backfill_range().is_none());
        ledger.submit(&create_test_block(7, "0xa"), "p", true, false, 1_000).unwrap();
        assert!(ledger.backfill_range().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_ledger_bounded_and_sorted(heights in proptest::collection::vec(1u64..2600, 1..2300)) {
            let mut ledger = BlockLedger::new();
            for (i, height) in heights.iter().enumerate() {
                ledger.submit(&create_test_block(*height, "0xa"), "peer", false, false, i as u64).unwrap();
                prop_assert!(ledger.len() <= MAX_HISTORY);
            }
            let retained: Vec<_> = ledger.slots().map(|s| s.height).collect();
            prop_assert!(retained.windows(2).all(|w| w[0] > w[1]));

            // Nothing known at or above the worst retained height is missing
            let worst = ledger.worst_height();
            let mut known: Vec<u64> = heights.iter().copied().filter(|h| *h >= worst).collect();
            known.sort_unstable_by(|a, b| b.cmp(a));
            known.dedup();
            prop_assert_eq!(retained, known);
        }

        #[test]
        fn prop_live_chain_keeps_top_heights(start in 1u64..100, count in 1usize..2300) {
            let mut ledger = BlockLedger::new();
            let heights: Vec<u64> = (start..start + count as u64).collect();
            for height in &heights {
                ledger.submit(&create_test_block(*height, "0xa"), "peer", false, false, *height).unwrap();
            }

            let expected: Vec<u64> = heights.iter().rev().take(MAX_HISTORY).copied().collect();
            let retained: Vec<u64> = ledger.slots().map(|s| s.height).collect();
            prop_assert_eq!(retained, expected);
        }

        #[test]
        fn prop_resubmission_never_duplicates(height in 1u64..500, times in 2usize..6) {
            let mut ledger = BlockLedger::new();
            let report = create_test_block(height, "0xa");
            for t in 0..times {
                let result = ledger.submit(&report, "peer", true, false, t as u64 * 10).unwrap();
                prop_assert_eq!(result.changed, t == 0);
            }
            let slot = ledger.get(height).unwrap();
            prop_assert_eq!(slot.forks.len(), 1);
            prop_assert_eq!(slot.propagation_entries().len(), 1);
        }
    }

    pub(crate) fn create_test_block(number: u64, hash: &str) -> BlockReport {
        BlockReport {
            number: Some(number as i64),
            hash: Some(hash.to_string()),
            parent_hash: Some(format!("0xparent{}", number)),
            miner: Some("0xminer".to_string()),
            difficulty: Some(1_000),
            total_difficulty: Some(number as u128 * 1_000),
            gas_limit: Some(8_000_000),
            gas_used: Some(21_000),
            timestamp: Some(1_700_000_000 + number * 15),
            transactions: Some(vec![]),
            uncles: Some(vec![]),
            ..Default::default()
        }
    }
}
