//! Ledger statistics
//!
//! Read-only summaries over the retained history: propagation and uncle
//! histograms, per-block series for charts, averages and the miner
//! leaderboard. Series cover the 40 most recent heights in chronological
//! order.

use serde::Serialize;
use std::collections::HashMap;

use super::{BlockLedger, HeightSlot};
use crate::types::BlockNumber;

/// Number of bins in every histogram and points in every series
pub const MAX_BINS: usize = 40;

/// Propagation values are clamped into this range (ms)
pub const MIN_PROPAGATION_RANGE: u64 = 0;
pub const MAX_PROPAGATION_RANGE: u64 = 10_000;

/// Heights covered by the uncle histogram
pub const MAX_UNCLES: usize = 1000;

/// Consecutive heights summed into one uncle bin
pub const MAX_UNCLES_PER_BIN: usize = 25;

/// Heights averaged for the hashrate estimate
pub const HASHRATE_WINDOW: usize = 64;

/// Number of miners on the leaderboard
pub const TOP_MINERS: usize = 2;

/// One propagation histogram bin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    /// Lower bound (ms)
    pub x: f64,
    /// Bin width (ms)
    pub dx: f64,
    /// Share of all values in this bin
    pub y: f64,
    pub frequency: usize,
    pub cumulative: usize,
    pub cumpercent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationChart {
    pub histogram: Vec<HistogramBin>,
    /// Mean propagation (ms), rounded
    pub avg: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinerCount {
    pub miner: String,
    pub name: Option<String>,
    pub blocks: usize,
}

/// Everything the display needs, computed in one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub height: Vec<BlockNumber>,
    pub blocktime: Vec<f64>,
    pub avg_blocktime: f64,
    pub difficulty: Vec<u128>,
    pub uncles: Vec<usize>,
    pub transactions: Vec<usize>,
    pub gas_spending: Vec<u64>,
    pub gas_limit: Vec<u64>,
    pub miners: Vec<MinerCount>,
    pub propagation: PropagationChart,
    pub uncle_count: Vec<usize>,
    pub avg_hashrate: f64,
}

impl BlockLedger {
    /// Most recent `n` slots in chronological order
    fn recent_chronological(&self, n: usize) -> Vec<&HeightSlot> {
        let mut recent: Vec<_> = self.slots().take(n).collect();
        recent.reverse();
        recent
    }

    /// Most recent `n` slots whose canonical block is trusted, chronological
    fn recent_trusted(&self, n: usize) -> Vec<&HeightSlot> {
        let mut recent: Vec<_> = self
            .slots()
            .filter(|slot| slot.canonical().trusted)
            .take(n)
            .collect();
        recent.reverse();
        recent
    }

    /// Histogram of all recorded propagation delays
    pub fn block_propagation(&self) -> PropagationChart {
        let values: Vec<u64> = self
            .slots()
            .flat_map(|slot| slot.propagation_entries().iter())
            .map(|entry| entry.propagation.clamp(MIN_PROPAGATION_RANGE, MAX_PROPAGATION_RANGE))
            .collect();

        let avg = if values.is_empty() {
            0
        } else {
            (values.iter().sum::<u64>() as f64 / values.len() as f64).round() as u64
        };

        let width = (MAX_PROPAGATION_RANGE - MIN_PROPAGATION_RANGE) as f64 / MAX_BINS as f64;
        let mut counts = [0usize; MAX_BINS];
        for value in &values {
            let bin = ((value - MIN_PROPAGATION_RANGE) as f64 / width) as usize;
            counts[bin.min(MAX_BINS - 1)] += 1;
        }

        let total = values.len();
        let mut cumulative = 0;
        let histogram = counts
            .iter()
            .enumerate()
            .map(|(i, &frequency)| {
                cumulative += frequency;
                HistogramBin {
                    x: MIN_PROPAGATION_RANGE as f64 + i as f64 * width,
                    dx: width,
                    y: if total == 0 { 0.0 } else { frequency as f64 / total as f64 },
                    frequency,
                    cumulative,
                    cumpercent: cumulative as f64 / total.max(1) as f64,
                }
            })
            .collect();

        PropagationChart { histogram, avg }
    }

    /// Uncle totals over the last 1000 heights, 25 heights per bin
    pub fn uncle_count(&self) -> Vec<usize> {
        let uncles: Vec<usize> = self
            .slots()
            .take(MAX_UNCLES)
            .map(|slot| slot.canonical().uncles.len())
            .collect();

        let mut bins = vec![0; MAX_BINS];
        for (bin, chunk) in uncles.chunks(MAX_UNCLES_PER_BIN).enumerate() {
            bins[bin] = chunk.iter().sum();
        }
        bins
    }

    /// Block times (seconds) of the last 40 heights
    pub fn block_times(&self) -> Vec<f64> {
        self.recent_chronological(MAX_BINS)
            .iter()
            .map(|slot| slot.canonical().time as f64 / 1000.0)
            .collect()
    }

    /// Mean block time (seconds) over every retained height
    pub fn avg_block_time(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let total: u64 = self.slots().map(|slot| slot.canonical().time).sum();
        total as f64 / self.len() as f64 / 1000.0
    }

    pub fn gas_limit_series(&self) -> Vec<u64> {
        self.recent_chronological(MAX_BINS)
            .iter()
            .map(|slot| slot.canonical().gas_limit)
            .collect()
    }

    pub fn difficulty_series(&self) -> Vec<u128> {
        self.recent_trusted(MAX_BINS)
            .iter()
            .map(|slot| slot.canonical().difficulty)
            .collect()
    }

    pub fn transaction_count_series(&self) -> Vec<usize> {
        self.recent_trusted(MAX_BINS)
            .iter()
            .map(|slot| slot.canonical().transactions.len())
            .collect()
    }

    pub fn gas_spending_series(&self) -> Vec<u64> {
        self.recent_trusted(MAX_BINS)
            .iter()
            .map(|slot| slot.canonical().gas_used)
            .collect()
    }

    /// Best difficulty over the mean block time of the last 64 heights
    pub fn avg_hashrate(&self) -> f64 {
        let Some(best) = self.best() else {
            return 0.0;
        };

        let times: Vec<u64> = self
            .slots()
            .take(HASHRATE_WINDOW)
            .map(|slot| slot.canonical().time)
            .collect();
        let avg_seconds = times.iter().sum::<u64>() as f64 / times.len() as f64 / 1000.0;

        if avg_seconds <= 0.0 {
            return 0.0;
        }
        best.canonical().difficulty as f64 / avg_seconds
    }

    /// Top miners by canonical blocks over the last 40 heights
    pub fn miners_count(&self) -> Vec<MinerCount> {
        let mut order: Vec<&str> = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();

        for slot in self.slots().take(MAX_BINS) {
            let miner = slot.canonical().miner.as_str();
            let count = counts.entry(miner).or_insert_with(|| {
                order.push(miner);
                0
            });
            *count += 1;
        }

        let mut miners: Vec<MinerCount> = order
            .into_iter()
            .map(|miner| MinerCount {
                miner: miner.to_string(),
                name: None,
                blocks: counts[miner],
            })
            .collect();

        // Stable: ties keep the most recently seen miner first
        miners.sort_by(|a, b| b.blocks.cmp(&a.blocks));
        miners.truncate(TOP_MINERS);
        miners
    }

    /// Full chart bundle for display clients
    pub fn charts(&self) -> ChartData {
        let recent = self.recent_chronological(MAX_BINS);

        ChartData {
            height: recent.iter().map(|slot| slot.height).collect(),
            blocktime: self.block_times(),
            avg_blocktime: self.avg_block_time(),
            difficulty: self.difficulty_series(),
            uncles: recent.iter().map(|slot| slot.canonical().uncles.len()).collect(),
            transactions: self.transaction_count_series(),
            gas_spending: self.gas_spending_series(),
            gas_limit: self.gas_limit_series(),
            miners: self.miners_count(),
            propagation: self.block_propagation(),
            uncle_count: self.uncle_count(),
            avg_hashrate: self.avg_hashrate(),
        }
    }
}
