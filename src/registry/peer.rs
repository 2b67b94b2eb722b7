//! Peer records
//!
//! One record per identified peer: metadata, the latest status snapshot, the
//! 40-entry propagation window and uptime accounting. Every setter compares
//! before mutating and returns [`Update::Unchanged`] when nothing moved.

use serde::Serialize;

use crate::ledger::{MAX_PEER_PROPAGATION, UNKNOWN_PROPAGATION};
use crate::types::{BasicStats, Block, Geo, Millis, NodeInfo, PeerId, PendingStats, Update};

/// Inactive peers older than this are evicted (4 hours)
pub const MAX_INACTIVE_TIME_MS: Millis = 4 * 60 * 60 * 1000;

/// Uptime accounting
///
/// Time between two status changes is charged to the state being left.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Uptime {
    pub started: Option<Millis>,
    pub up: Millis,
    pub down: Millis,
    pub last_status: Option<bool>,
    pub last_update: Option<Millis>,
}

impl Uptime {
    /// Record a status observation at `now`
    fn observe(&mut self, active: bool, now: Millis) {
        match (self.started, self.last_status, self.last_update) {
            (Some(_), Some(previous), Some(last)) => {
                let elapsed = now.saturating_sub(last);
                if previous {
                    self.up += elapsed;
                } else {
                    self.down += elapsed;
                }
            }
            _ => self.started = Some(now),
        }

        self.last_status = Some(active);
        self.last_update = Some(now);
    }

    /// Percentage of observed time spent up
    pub fn percent(&self) -> u8 {
        match (self.started, self.last_update) {
            (Some(started), Some(last)) if last > started => {
                let ratio = self.up as f64 / (last - started) as f64;
                (ratio * 100.0).round().clamp(0.0, 100.0) as u8
            }
            _ => 100,
        }
    }
}

/// Status snapshot of one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub active: bool,
    pub mining: bool,
    pub syncing: bool,
    pub hashrate: u64,
    pub peers: u32,
    pub pending: u64,
    pub gas_price: u128,
    pub block: Block,
    pub propagation_avg: u64,
    pub latency: u64,
    pub uptime: u8,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            active: false,
            mining: false,
            syncing: false,
            hashrate: 0,
            peers: 0,
            pending: 0,
            gas_price: 0,
            block: Block::default(),
            propagation_avg: 0,
            latency: 0,
            uptime: 100,
        }
    }
}

/// Connection-level facts supplied with `hello`
#[derive(Debug, Clone, Default)]
pub struct Identification {
    pub info: Option<NodeInfo>,
    /// Remote address, already normalised
    pub ip: Option<String>,
    /// Transport connection handle
    pub connection: Option<String>,
    pub latency: Option<u64>,
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Full public view, sent when a peer is added and in peer lists
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub id: PeerId,
    pub info: NodeInfo,
    pub stats: NodeStats,
    pub history: Vec<i64>,
    pub geo: Option<Geo>,
}

/// Stats view without metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub id: PeerId,
    pub stats: NodeStats,
    pub history: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSnapshot {
    pub id: PeerId,
    pub block: Block,
    pub propagation_avg: u64,
    pub history: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStatsView {
    pub active: bool,
    pub mining: bool,
    pub syncing: bool,
    pub hashrate: u64,
    pub peers: u32,
    pub gas_price: u128,
    pub uptime: u8,
    pub latency: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicStatsSnapshot {
    pub id: PeerId,
    pub stats: BasicStatsView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSnapshot {
    pub id: PeerId,
    pub pending: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub id: PeerId,
    pub latency: u64,
}

// =============================================================================
// PEER RECORD
// =============================================================================

/// One tracked peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    id: PeerId,
    connection: Option<String>,
    trusted: bool,
    info: NodeInfo,
    geo: Option<Geo>,
    stats: NodeStats,
    history: Vec<i64>,
    uptime: Uptime,
}

impl PeerRecord {
    /// Create a record; the first status observation starts uptime accounting
    pub fn new(id: impl Into<PeerId>, now: Millis) -> Self {
        let mut record = Self {
            id: id.into(),
            connection: None,
            trusted: false,
            info: NodeInfo::default(),
            geo: None,
            stats: NodeStats::default(),
            history: vec![UNKNOWN_PROPAGATION; MAX_PEER_PROPAGATION],
            uptime: Uptime::default(),
        };
        record.set_active(true, now);
        record
    }

    /// Apply `hello` metadata; safe to repeat without resetting uptime
    pub fn identify(
        &mut self,
        identification: Identification,
        trusted: bool,
        geo: Option<Geo>,
        now: Millis,
    ) -> NodeSnapshot {
        if let Some(info) = identification.info {
            self.info = info;
        }

        if let Some(latency) = identification.latency {
            self.stats.latency = latency;
        }

        if let Some(ip) = identification.ip {
            if trusted {
                self.trusted = true;
            }
            self.info.ip = Some(ip);
            self.geo = geo;
        }

        if identification.connection.is_some() {
            self.connection = identification.connection;
        }

        self.set_active(true, now);
        self.snapshot()
    }

    /// Replace the head block and propagation window if either changed
    pub fn apply_block(&mut self, block: Block, history: Vec<i64>) -> Update<BlockSnapshot> {
        if history == self.history && block == self.stats.block {
            return Update::Unchanged;
        }

        if block != self.stats.block {
            self.stats.block = block;
        }
        self.set_history(history);

        Update::Changed(self.block_snapshot())
    }

    /// Store a propagation window and recompute its average
    ///
    /// A window of the wrong length is treated as unknown.
    fn set_history(&mut self, history: Vec<i64>) -> bool {
        if history == self.history {
            return false;
        }

        if history.len() != MAX_PEER_PROPAGATION {
            self.history = vec![UNKNOWN_PROPAGATION; MAX_PEER_PROPAGATION];
            self.stats.propagation_avg = 0;
            return true;
        }

        let known: Vec<i64> = history.iter().copied().filter(|p| *p >= 0).collect();
        self.stats.propagation_avg = if known.is_empty() {
            0
        } else {
            (known.iter().sum::<i64>() as f64 / known.len() as f64).round() as u64
        };
        self.history = history;
        true
    }

    /// Apply mining/syncing/hashrate/peers/gas price
    ///
    /// A change of the reported `active` flag goes through the uptime state
    /// machine; the peer's own uptime figure is not trusted.
    pub fn apply_basic_stats(&mut self, stats: &BasicStats, now: Millis) -> Update<BasicStatsSnapshot> {
        let current = (
            self.stats.active,
            self.stats.mining,
            self.stats.syncing,
            self.stats.hashrate,
            self.stats.peers,
            self.stats.gas_price,
        );
        let incoming = (
            stats.active,
            stats.mining,
            stats.syncing,
            stats.hashrate,
            stats.peers,
            stats.gas_price,
        );
        if current == incoming {
            return Update::Unchanged;
        }

        if stats.active != self.stats.active {
            self.set_active(stats.active, now);
        }
        self.stats.mining = stats.mining;
        self.stats.syncing = stats.syncing;
        self.stats.hashrate = stats.hashrate;
        self.stats.peers = stats.peers;
        self.stats.gas_price = stats.gas_price;

        Update::Changed(self.basic_snapshot())
    }

    /// `None` pending count is malformed input and is reported by the caller
    pub fn apply_pending(&mut self, stats: &PendingStats) -> Option<Update<PendingSnapshot>> {
        let pending = stats.pending?;
        if pending == self.stats.pending {
            return Some(Update::Unchanged);
        }

        self.stats.pending = pending;
        Some(Update::Changed(PendingSnapshot {
            id: self.id.clone(),
            pending,
        }))
    }

    pub fn apply_latency(&mut self, latency: u64) -> Update<LatencySnapshot> {
        if latency == self.stats.latency {
            return Update::Unchanged;
        }

        self.stats.latency = latency;
        Update::Changed(LatencySnapshot {
            id: self.id.clone(),
            latency,
        })
    }

    /// Feed the uptime state machine and recompute the uptime percentage
    pub fn set_active(&mut self, active: bool, now: Millis) {
        self.uptime.observe(active, now);
        self.stats.active = active;
        self.stats.uptime = self.uptime.percent();
    }

    /// Inactive for longer than [`MAX_INACTIVE_TIME_MS`]
    pub fn is_stale_inactive(&self, now: Millis) -> bool {
        match (self.uptime.last_status, self.uptime.last_update) {
            (Some(false), Some(last)) => now.saturating_sub(last) > MAX_INACTIVE_TIME_MS,
            _ => false,
        }
    }

    /// Trusted, explicitly permitted, or peered and not syncing
    pub fn can_update_history(&self) -> bool {
        self.trusted || self.info.can_update_history || (!self.stats.syncing && self.stats.peers > 0)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn block_number(&self) -> u64 {
        self.stats.block.number
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            info: self.info.clone(),
            stats: self.stats.clone(),
            history: self.history.clone(),
            geo: self.geo.clone(),
        }
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            id: self.id.clone(),
            stats: self.stats.clone(),
            history: self.history.clone(),
        }
    }

    pub fn block_snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            id: self.id.clone(),
            block: self.stats.block.clone(),
            propagation_avg: self.stats.propagation_avg,
            history: self.history.clone(),
        }
    }

    pub fn basic_snapshot(&self) -> BasicStatsSnapshot {
        BasicStatsSnapshot {
            id: self.id.clone(),
            stats: BasicStatsView {
                active: self.stats.active,
                mining: self.stats.mining,
                syncing: self.stats.syncing,
                hashrate: self.stats.hashrate,
                peers: self.stats.peers,
                gas_price: self.stats.gas_price,
                uptime: self.stats.uptime,
                latency: self.stats.latency,
            },
        }
    }
}
