//! Collector Messages
//!
//! JSON messages exchanged with peers and display clients.
//!
//! ## Peer → collector
//!
//! `{"emit": "<event>", "data": {...}}`, every payload carrying the peer `id`.
//!
//! ## Collector → peer
//!
//! `{"emit": "ready" | "node-pong" | "history", "data": ...}`
//!
//! ## Collector → display clients
//!
//! `{"action": "<event>", "data": ...}`

use serde::{Deserialize, Serialize};

use crate::ledger::stats::ChartData;
use crate::ledger::BackfillRange;
use crate::registry::{
    BasicStatsSnapshot, BlockSnapshot, LatencySnapshot, NodeSnapshot, PendingSnapshot,
    StatsSnapshot,
};
use crate::types::{
    numeric, BasicStats, BlockNumber, BlockReport, Millis, NodeInfo, PeerId, PendingStats,
    StatsReport,
};

/// Identification sent once per connection
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub id: Option<PeerId>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub info: Option<NodeInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateMessage {
    pub id: PeerId,
    #[serde(default)]
    pub stats: Option<StatsReport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockMessage {
    pub id: PeerId,
    #[serde(default)]
    pub block: Option<BlockReport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingMessage {
    pub id: PeerId,
    #[serde(default)]
    pub stats: Option<PendingStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsMessage {
    pub id: PeerId,
    #[serde(default)]
    pub stats: Option<BasicStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessage {
    pub id: PeerId,
    #[serde(default)]
    pub history: Vec<BlockReport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    #[serde(default)]
    pub id: Option<PeerId>,
    #[serde(default)]
    pub client_time: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatencyMessage {
    pub id: PeerId,
    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub latency: Option<u64>,
}

/// Peer → collector
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "emit", content = "data", rename_all = "kebab-case")]
pub enum Inbound {
    Hello(Hello),
    Update(UpdateMessage),
    Block(BlockMessage),
    Pending(PendingMessage),
    Stats(StatsMessage),
    History(HistoryMessage),
    NodePing(PingMessage),
    Latency(LatencyMessage),
}

impl Inbound {
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::Hello(_) => "hello",
            Inbound::Update(_) => "update",
            Inbound::Block(_) => "block",
            Inbound::Pending(_) => "pending",
            Inbound::Stats(_) => "stats",
            Inbound::History(_) => "history",
            Inbound::NodePing(_) => "node-ping",
            Inbound::Latency(_) => "latency",
        }
    }

    /// Peer id the payload claims to speak for
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Inbound::Hello(hello) => hello.id.as_deref(),
            Inbound::Update(message) => Some(&message.id),
            Inbound::Block(message) => Some(&message.id),
            Inbound::Pending(message) => Some(&message.id),
            Inbound::Stats(message) => Some(&message.id),
            Inbound::History(message) => Some(&message.id),
            Inbound::NodePing(ping) => ping.id.as_deref(),
            Inbound::Latency(message) => Some(&message.id),
        }
    }
}

/// Collector → peer, on the peer's own connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "emit", content = "data", rename_all = "kebab-case")]
pub enum PeerReply {
    Ready,
    #[serde(rename_all = "camelCase")]
    NodePong {
        client_time: Option<serde_json::Value>,
        server_time: Millis,
    },
    History(BackfillRange),
}

/// Collector → display clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum Outbound {
    Add(NodeSnapshot),
    Update(StatsSnapshot),
    Block(BlockSnapshot),
    Pending(PendingSnapshot),
    Stats(BasicStatsSnapshot),
    Latency(LatencySnapshot),
    Inactive(StatsSnapshot),
    Removed { id: PeerId },
    Init { nodes: Vec<NodeSnapshot> },
    Charts(Box<ChartData>),
    LastBlock { number: BlockNumber },
}

impl Outbound {
    pub fn name(&self) -> &'static str {
        match self {
            Outbound::Add(_) => "add",
            Outbound::Update(_) => "update",
            Outbound::Block(_) => "block",
            Outbound::Pending(_) => "pending",
            Outbound::Stats(_) => "stats",
            Outbound::Latency(_) => "latency",
            Outbound::Inactive(_) => "inactive",
            Outbound::Removed { .. } => "removed",
            Outbound::Init { .. } => "init",
            Outbound::Charts(_) => "charts",
            Outbound::LastBlock { .. } => "lastBlock",
        }
    }
}
