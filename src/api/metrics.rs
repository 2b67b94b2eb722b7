//! Metrics Collection
//!
//! Counters for peer traffic and ledger activity, exported as Prometheus text
//! or JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Collector counters and gauges
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Decoded peer messages
    pub reports_received: AtomicU64,

    /// Block reports that changed the ledger
    pub blocks_accepted: AtomicU64,

    /// Malformed or unroutable reports
    pub reports_rejected: AtomicU64,

    /// Hellos refused by the gate
    pub auth_rejected: AtomicU64,

    /// Chart bundles computed
    pub chart_recomputes: AtomicU64,

    /// History requests sent to peers
    pub backfill_requests: AtomicU64,

    /// Open peer connections
    pub open_connections: AtomicU64,

    pub active_peers: AtomicU64,

    pub best_height: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn inc_reports_received(&self) {
        self.reports_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocks_accepted(&self) {
        self.blocks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reports_rejected(&self) {
        self.reports_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_auth_rejected(&self) {
        self.auth_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chart_recomputes(&self) {
        self.chart_recomputes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backfill_requests(&self) {
        self.backfill_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn set_active_peers(&self, count: u64) {
        self.active_peers.store(count, Ordering::Relaxed);
    }

    pub fn set_best_height(&self, height: u64) {
        self.best_height.store(height, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let series = [
            ("uptime_seconds", "gauge", "Collector uptime in seconds", self.uptime_secs()),
            ("reports_total", "counter", "Peer messages received", self.reports_received.load(Ordering::Relaxed)),
            ("blocks_accepted_total", "counter", "Block reports that changed the ledger", self.blocks_accepted.load(Ordering::Relaxed)),
            ("reports_rejected_total", "counter", "Malformed or unroutable reports", self.reports_rejected.load(Ordering::Relaxed)),
            ("auth_rejected_total", "counter", "Hellos refused", self.auth_rejected.load(Ordering::Relaxed)),
            ("chart_recomputes_total", "counter", "Chart bundles computed", self.chart_recomputes.load(Ordering::Relaxed)),
            ("backfill_requests_total", "counter", "History requests sent to peers", self.backfill_requests.load(Ordering::Relaxed)),
            ("open_connections", "gauge", "Open peer connections", self.open_connections.load(Ordering::Relaxed)),
            ("active_peers", "gauge", "Active peers", self.active_peers.load(Ordering::Relaxed)),
            ("best_height", "gauge", "Best retained block height", self.best_height.load(Ordering::Relaxed)),
        ];

        let mut output = String::new();
        for (name, kind, help, value) in series {
            output.push_str(&format!(
                "# HELP netstats_{name} {help}\n\
                 # TYPE netstats_{name} {kind}\n\
                 netstats_{name} {value}\n\n",
            ));
        }
        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "reports": {
                "received": self.reports_received.load(Ordering::Relaxed),
                "rejected": self.reports_rejected.load(Ordering::Relaxed),
                "auth_rejected": self.auth_rejected.load(Ordering::Relaxed),
            },
            "ledger": {
                "blocks_accepted": self.blocks_accepted.load(Ordering::Relaxed),
                "chart_recomputes": self.chart_recomputes.load(Ordering::Relaxed),
                "backfill_requests": self.backfill_requests.load(Ordering::Relaxed),
                "best_height": self.best_height.load(Ordering::Relaxed),
            },
            "network": {
                "open_connections": self.open_connections.load(Ordering::Relaxed),
                "active_peers": self.active_peers.load(Ordering::Relaxed),
            },
        })
    }
}
