//! Core types for collector communication
//!
//! These types define what peers report (block reports, stats, pending counts)
//! and what the collector stamps onto accepted blocks. Inbound payloads are
//! lenient: numeric fields may arrive as JSON numbers, decimal strings or
//! `0x` hex strings, and required fields are optional until validated.

use serde::{Deserialize, Serialize};

/// Helper module for lenient numeric fields (number, decimal string or hex string)
pub(crate) mod numeric {
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Text(String),
    }

    impl Raw {
        fn into_i128(self) -> Result<i128, String> {
            match self {
                Raw::Unsigned(v) => Ok(v as i128),
                Raw::Signed(v) => Ok(v as i128),
                Raw::Float(v) if v.is_finite() => Ok(v.trunc() as i128),
                Raw::Float(v) => Err(format!("non-finite number {}", v)),
                Raw::Text(s) => {
                    let s = s.trim();
                    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                        if hex.is_empty() {
                            return Ok(0);
                        }
                        i128::from_str_radix(hex, 16).map_err(|e| e.to_string())
                    } else {
                        s.parse::<i128>().map_err(|e| e.to_string())
                    }
                }
            }
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<i128>,
    {
        let value = Raw::deserialize(deserializer)?
            .into_i128()
            .map_err(de::Error::custom)?;
        T::try_from(value)
            .map_err(|_| de::Error::custom(format!("numeric value {} out of range", value)))
    }

    pub fn deserialize_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<i128>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) => {
                let value = raw.into_i128().map_err(de::Error::custom)?;
                T::try_from(value)
                    .map(Some)
                    .map_err(|_| de::Error::custom(format!("numeric value {} out of range", value)))
            }
        }
    }
}

// =============================================================================
// PRIMITIVE TYPES
// =============================================================================

/// Block height
pub type BlockNumber = u64;

/// Milliseconds since the Unix epoch
pub type Millis = u64;

/// Opaque peer identifier, unique per active connection
pub type PeerId = String;

/// Hash reported for a peer that has not sent a block yet
pub const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis().max(0) as Millis
}

// =============================================================================
// UPDATE RESULT
// =============================================================================

/// Outcome of a mutation that skips work when the value is already current
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    /// Nothing changed, nothing to broadcast
    Unchanged,
    /// State changed; carries the snapshot to broadcast
    Changed(T),
}

impl<T> Update<T> {
    pub fn is_changed(&self) -> bool {
        matches!(self, Update::Changed(_))
    }

    pub fn changed(self) -> Option<T> {
        match self {
            Update::Changed(value) => Some(value),
            Update::Unchanged => None,
        }
    }
}

// =============================================================================
// BLOCKS
// =============================================================================

/// Block as reported by a peer, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReport {
    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub number: Option<i64>,

    #[serde(default)]
    pub hash: Option<String>,

    #[serde(default)]
    pub parent_hash: Option<String>,

    #[serde(default)]
    pub sha3_uncles: Option<String>,

    #[serde(default)]
    pub transactions_root: Option<String>,

    #[serde(default)]
    pub state_root: Option<String>,

    #[serde(default)]
    pub miner: Option<String>,

    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub difficulty: Option<u128>,

    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub total_difficulty: Option<u128>,

    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub gas_limit: Option<u64>,

    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub gas_used: Option<u64>,

    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub timestamp: Option<u64>,

    #[serde(default)]
    pub transactions: Option<Vec<serde_json::Value>>,

    #[serde(default)]
    pub uncles: Option<Vec<serde_json::Value>>,
}

impl BlockReport {
    /// Convert into a [`Block`], or `None` if a required field is missing
    ///
    /// Required: number (> 0), uncle list, transaction list, difficulty.
    pub fn validate(&self) -> Option<Block> {
        let number = self.number.filter(|n| *n > 0)? as BlockNumber;
        let difficulty = self.difficulty?;
        let transactions = self.transactions.clone()?;
        let uncles = self.uncles.clone()?;

        Some(Block {
            number,
            hash: self.hash.clone().unwrap_or_default(),
            parent_hash: self.parent_hash.clone().unwrap_or_default(),
            sha3_uncles: self.sha3_uncles.clone().unwrap_or_default(),
            transactions_root: self.transactions_root.clone().unwrap_or_default(),
            state_root: self.state_root.clone().unwrap_or_default(),
            miner: self.miner.clone().unwrap_or_default(),
            difficulty,
            total_difficulty: self.total_difficulty.unwrap_or(0),
            gas_limit: self.gas_limit.unwrap_or(0),
            gas_used: self.gas_used.unwrap_or(0),
            timestamp: self.timestamp.unwrap_or(0),
            transactions,
            uncles,
            ..Block::default()
        })
    }
}

/// A validated block plus the timing metadata the collector stamps onto it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: BlockNumber,
    pub hash: String,
    pub parent_hash: String,
    pub sha3_uncles: String,
    pub transactions_root: String,
    pub state_root: String,
    pub miner: String,
    pub difficulty: u128,
    pub total_difficulty: u128,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// On-chain timestamp (seconds)
    pub timestamp: u64,
    pub transactions: Vec<serde_json::Value>,
    pub uncles: Vec<serde_json::Value>,

    /// Reported by a trusted peer
    pub trusted: bool,
    /// First arrival of this fork (ms)
    pub arrived: Millis,
    /// When the reporting peer's copy was received (ms)
    pub received: Millis,
    /// Delay relative to the fork's first arrival (ms)
    pub propagation: Millis,
    /// Time since the previous retained block (ms)
    pub time: Millis,
    /// Fork index within its height slot, `None` until resolved
    pub fork: Option<usize>,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            number: 0,
            hash: ZERO_HASH.to_string(),
            parent_hash: String::new(),
            sha3_uncles: String::new(),
            transactions_root: String::new(),
            state_root: String::new(),
            miner: String::new(),
            difficulty: 0,
            total_difficulty: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            transactions: Vec::new(),
            uncles: Vec::new(),
            trusted: false,
            arrived: 0,
            received: 0,
            propagation: 0,
            time: 0,
            fork: None,
        }
    }
}

impl Block {
    /// Structural equality over consensus-relevant fields only
    pub fn same_fork(&self, other: &Block) -> bool {
        self.hash == other.hash
            && self.parent_hash == other.parent_hash
            && self.sha3_uncles == other.sha3_uncles
            && self.transactions_root == other.transactions_root
            && self.state_root == other.state_root
            && self.miner == other.miner
            && self.difficulty == other.difficulty
            && self.total_difficulty == other.total_difficulty
    }
}

// =============================================================================
// PEER METADATA AND STATS
// =============================================================================

/// Free-form node metadata sent in `hello`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    /// Peer explicitly allowed to supply history
    #[serde(default)]
    pub can_update_history: bool,

    /// Filled in by the collector from the connection address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Geolocation lookup result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geo {
    pub country: String,
    pub region: String,
    pub city: String,
    /// Latitude, longitude
    pub ll: (f64, f64),
}

/// Basic node stats (`stats` message)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStats {
    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub mining: bool,

    #[serde(default)]
    pub syncing: bool,

    #[serde(default, deserialize_with = "numeric::deserialize")]
    pub hashrate: u64,

    #[serde(default, deserialize_with = "numeric::deserialize")]
    pub peers: u32,

    #[serde(default, deserialize_with = "numeric::deserialize")]
    pub gas_price: u128,
}

/// Pending transaction count (`pending` message)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PendingStats {
    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub pending: Option<u64>,
}

/// Combined status report (`update` message)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsReport {
    #[serde(default)]
    pub block: Option<BlockReport>,

    #[serde(flatten)]
    pub basic: BasicStats,

    #[serde(default, deserialize_with = "numeric::deserialize_opt")]
    pub pending: Option<u64>,
}
