//! Peer Registry Module
//!
//! Owns every [`PeerRecord`] and the single [`BlockLedger`]. Each call routes
//! one decoded message to the right record and/or the ledger and returns the
//! snapshot to broadcast, [`Update::Unchanged`], or a [`CollectorError`].
//!
//! The registry never performs I/O; geolocation results are passed in.

pub mod geo;
pub mod peer;

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, trace};

use crate::error::CollectorError;
use crate::ledger::stats::ChartData;
use crate::ledger::{BackfillRange, BlockLedger};
use crate::types::{
    BasicStats, BlockNumber, BlockReport, Geo, Millis, PeerId, PendingStats, StatsReport, Update,
};

pub use peer::{
    BasicStatsSnapshot, BlockSnapshot, Identification, LatencySnapshot, NodeSnapshot, PeerRecord,
    PendingSnapshot, StatsSnapshot,
};

/// Fleet-wide cooldown between backfill requests (2 minutes)
pub const BACKFILL_COOLDOWN_MS: Millis = 2 * 60 * 1000;

/// Who may promote canonical blocks
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    trusted_ips: HashSet<String>,
    trust_all: bool,
}

impl TrustPolicy {
    pub fn new(trusted_ips: impl IntoIterator<Item = String>, trust_all: bool) -> Self {
        Self {
            trusted_ips: trusted_ips.into_iter().collect(),
            trust_all,
        }
    }

    pub fn is_trusted(&self, ip: &str) -> bool {
        self.trust_all || self.trusted_ips.contains(geo::normalize_ip(ip))
    }
}

/// Outcome of a block report
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutcome {
    pub update: Update<BlockSnapshot>,
    /// Set when this block raised the highest accepted number
    pub new_highest: Option<BlockNumber>,
    /// Whether the ledger itself changed
    pub ledger_changed: bool,
}

/// Summary for the status endpoint
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total_peers: usize,
    pub active_peers: usize,
    pub trusted_peers: usize,
    pub ledger_heights: usize,
    pub best_height: BlockNumber,
    pub highest_block: BlockNumber,
}

/// Peers plus the shared ledger
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<PeerId, PeerRecord>,
    ledger: BlockLedger,
    trust: TrustPolicy,
    highest_block: BlockNumber,
    last_backfill_request: Option<Millis>,
}

impl Registry {
    pub fn new(trust: TrustPolicy) -> Self {
        Self {
            trust,
            ..Self::default()
        }
    }

    /// Create or re-identify a peer
    pub fn add_peer(
        &mut self,
        id: &str,
        mut identification: Identification,
        location: Option<Geo>,
        now: Millis,
    ) -> NodeSnapshot {
        identification.ip = identification.ip.map(|ip| geo::normalize_ip(&ip).to_string());
        let trusted = identification
            .ip
            .as_deref()
            .map(|ip| self.trust.is_trusted(ip))
            .unwrap_or(self.trust.trust_all);

        let record = self.peers.entry(id.to_string()).or_insert_with(|| {
            info!("👋 New peer {} (trusted={})", id, trusted);
            PeerRecord::new(id, now)
        });

        record.identify(identification, trusted, location, now)
    }

    /// Combined block + basic stats + pending report
    pub fn update_peer_status(
        &mut self,
        id: &str,
        report: &StatsReport,
        now: Millis,
    ) -> Result<Update<StatsSnapshot>, CollectorError> {
        let trusted = self.peer(id)?.is_trusted();
        let block = report.block.as_ref().ok_or(CollectorError::BlockDataWrong)?;
        let submission = self
            .ledger
            .submit(block, id, trusted, false, now)
            .ok_or(CollectorError::BlockDataWrong)?;
        let history = self.ledger.peer_propagation_vector(id, now);

        let peer = self.peer_mut(id)?;
        let mut changed = peer.apply_block(submission.block, history).is_changed();
        changed |= peer.apply_basic_stats(&report.basic, now).is_changed();
        if let Some(pending) = peer.apply_pending(&PendingStats { pending: report.pending }) {
            changed |= pending.is_changed();
        }

        Ok(if changed {
            Update::Changed(peer.stats_snapshot())
        } else {
            Update::Unchanged
        })
    }

    /// Apply a block report
    pub fn add_block(
        &mut self,
        id: &str,
        report: &BlockReport,
        now: Millis,
    ) -> Result<BlockOutcome, CollectorError> {
        let trusted = self.peer(id)?.is_trusted();
        let submission = self
            .ledger
            .submit(report, id, trusted, false, now)
            .ok_or(CollectorError::BlockUndefined)?;

        let new_highest = if submission.block.number > self.highest_block {
            self.highest_block = submission.block.number;
            Some(self.highest_block)
        } else {
            None
        };

        let ledger_changed = submission.changed;
        let history = self.ledger.peer_propagation_vector(id, now);
        let update = self.peer_mut(id)?.apply_block(submission.block, history);

        trace!("Block report from {} (ledger_changed={})", id, ledger_changed);

        Ok(BlockOutcome {
            update,
            new_highest,
            ledger_changed,
        })
    }

    pub fn update_basic_stats(
        &mut self,
        id: &str,
        stats: &BasicStats,
        now: Millis,
    ) -> Result<Update<BasicStatsSnapshot>, CollectorError> {
        Ok(self.peer_mut(id)?.apply_basic_stats(stats, now))
    }

    pub fn add_pending(
        &mut self,
        id: &str,
        stats: &PendingStats,
    ) -> Result<Update<PendingSnapshot>, CollectorError> {
        self.peer_mut(id)?
            .apply_pending(stats)
            .ok_or(CollectorError::StatsUndefined)
    }

    pub fn update_latency(
        &mut self,
        id: &str,
        latency: Option<u64>,
    ) -> Result<Update<LatencySnapshot>, CollectorError> {
        let latency = latency.ok_or(CollectorError::LatencyUndefined)?;
        Ok(self.peer_mut(id)?.apply_latency(latency))
    }

    /// Mark the peer bound to a transport connection as inactive
    pub fn mark_inactive(
        &mut self,
        connection: &str,
        now: Millis,
    ) -> Result<StatsSnapshot, CollectorError> {
        let peer = self
            .peers
            .values_mut()
            .find(|peer| peer.connection() == Some(connection))
            .ok_or(CollectorError::NodeNotFound)?;

        peer.set_active(false, now);
        info!("💤 Peer {} inactive", peer.id());
        Ok(peer.stats_snapshot())
    }

    /// Replay historical blocks (newest first on input) as backfill
    ///
    /// Returns how many submissions changed the ledger.
    pub fn ingest_backfill(
        &mut self,
        id: &str,
        mut blocks: Vec<BlockReport>,
        now: Millis,
    ) -> Result<usize, CollectorError> {
        let trusted = self.peer(id)?.is_trusted();
        blocks.reverse();

        let mut changed = 0;
        for block in &blocks {
            if let Some(submission) = self.ledger.submit(block, id, trusted, true, now) {
                if submission.changed {
                    changed += 1;
                }
            }
        }

        debug!("📚 Backfill from {}: {}/{} blocks changed the ledger", id, changed, blocks.len());
        Ok(changed)
    }

    /// Drop peers that have been inactive for over 4 hours, returning their ids
    pub fn evict_stale(&mut self, now: Millis) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_stale_inactive(now))
            .map(|peer| peer.id().to_string())
            .collect();

        for id in &stale {
            self.peers.remove(id);
            debug!("Evicted stale peer {}", id);
        }
        stale
    }

    /// Evict stale peers, then list the rest ordered by id
    pub fn list_active_peers(&mut self, now: Millis) -> Vec<NodeSnapshot> {
        self.evict_stale(now);

        let mut peers: Vec<NodeSnapshot> = self.peers.values().map(PeerRecord::snapshot).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Peer can supply history and is at or beyond the ledger's best height
    pub fn peer_is_eligible_for_backfill_request(&self, id: &str) -> bool {
        self.peers
            .get(id)
            .map(|peer| peer.can_update_history() && peer.block_number() >= self.ledger.best_height())
            .unwrap_or(false)
    }

    /// Eligible peer, room in the ledger, and no request in the last 2 minutes
    pub fn should_request_backfill(&self, id: &str, now: Millis) -> bool {
        let cooled_down = self
            .last_backfill_request
            .map(|at| now.saturating_sub(at) > BACKFILL_COOLDOWN_MS)
            .unwrap_or(true);

        cooled_down && self.ledger.has_room() && self.peer_is_eligible_for_backfill_request(id)
    }

    pub fn mark_backfill_requested(&mut self, now: Millis) {
        self.last_backfill_request = Some(now);
    }

    pub fn backfill_range(&self) -> Option<BackfillRange> {
        self.ledger.backfill_range()
    }

    pub fn charts(&self) -> ChartData {
        self.ledger.charts()
    }

    pub fn best_block_number(&self) -> BlockNumber {
        self.ledger.best_height()
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &BlockLedger {
        &self.ledger
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_peers: self.peers.len(),
            active_peers: self.peers.values().filter(|p| p.stats().active).count(),
            trusted_peers: self.peers.values().filter(|p| p.is_trusted()).count(),
            ledger_heights: self.ledger.len(),
            best_height: self.ledger.best_height(),
            highest_block: self.highest_block,
        }
    }

    fn peer(&self, id: &str) -> Result<&PeerRecord, CollectorError> {
        self.peers.get(id).ok_or(CollectorError::NodeNotFound)
    }

    fn peer_mut(&mut self, id: &str) -> Result<&mut PeerRecord, CollectorError> {
        self.peers.get_mut(id).ok_or(CollectorError::NodeNotFound)
    }
}
