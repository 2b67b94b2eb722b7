//! HTTP API Module
//!
//! Read-only view of the collector for display clients and monitoring:
//! peer and chart snapshots, a server-sent event stream, and metrics.

mod metrics;
mod routes;

pub use metrics::Metrics;
pub use routes::run_api_server;
