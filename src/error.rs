//! Collector errors
//!
//! Every failure is per-operation and recoverable; the transport decides
//! whether to drop the message, log it, or close the connection.

/// Per-operation failures surfaced to the transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectorError {
    #[error("Node not found")]
    NodeNotFound,

    #[error("Block undefined")]
    BlockUndefined,

    #[error("Block data wrong")]
    BlockDataWrong,

    #[error("Stats undefined")]
    StatsUndefined,

    #[error("Latency undefined")]
    LatencyUndefined,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Frame error: {0}")]
    Frame(String),
}

impl CollectorError {
    /// Errors that should end the peer connection rather than drop one message
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, CollectorError::Unauthorized(_) | CollectorError::Frame(_))
    }
}
