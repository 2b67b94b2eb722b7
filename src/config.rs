//! Collector Configuration
//!
//! Loaded from a TOML file, then overridden from the command line and
//! environment (`WS_SECRET`, `LITE`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::registry::geo::GeoEntry;

/// Main configuration for the collector service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    // === Network ===

    /// Port for peer connections (TCP)
    pub peer_port: u16,

    /// Port for the HTTP API
    pub api_port: u16,

    /// Largest accepted peer frame (bytes)
    pub max_message_size: usize,

    /// Capacity of the outbound event channel
    pub event_buffer: usize,

    // === Access ===

    /// Shared secrets accepted in `hello`
    pub ws_secrets: Vec<String>,

    /// Addresses whose reports may promote canonical blocks
    pub trusted_ips: Vec<String>,

    /// Addresses refused at `hello`
    pub banned_ips: Vec<String>,

    /// Peer ids nobody may claim
    pub reserved_ids: Vec<String>,

    /// Treat every peer as trusted
    pub trust_all: bool,

    // === Timing ===

    /// Quiet period before charts are recomputed (ms)
    pub chart_debounce_ms: u64,

    /// Longest a pending chart recompute may be deferred (ms)
    pub chart_max_wait_ms: u64,

    /// Interval for the full peer-list broadcast and stale eviction (seconds)
    pub peer_list_refresh_secs: u64,

    // === Geolocation ===

    /// GeoIP2/GeoLite2 City database (`.mmdb`)
    pub geoip_database: Option<PathBuf>,

    /// Static address-prefix table, consulted when the database has no answer
    pub geo_table: Vec<GeoEntry>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            peer_port: 3000,
            api_port: 3001,
            max_message_size: 1024 * 1024,
            event_buffer: 1024,

            ws_secrets: vec![],
            trusted_ips: vec![],
            banned_ips: vec![],
            reserved_ids: vec![],
            trust_all: false,

            chart_debounce_ms: 1_000,
            chart_max_wait_ms: 5_000,
            peer_list_refresh_secs: 3_600,

            geoip_database: None,
            geo_table: vec![],
        }
    }
}

impl CollectorConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_peer_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.peer_port = port;
        }
        self
    }

    pub fn with_api_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.api_port = port;
        }
        self
    }

    /// Secrets from the command line or `WS_SECRET` replace the file's list
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        let secrets: Vec<String> = secrets
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !secrets.is_empty() {
            self.ws_secrets = secrets;
        }
        self
    }

    pub fn with_trust_all(mut self, trust_all: bool) -> Self {
        self.trust_all |= trust_all;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ws_secrets.is_empty() && !self.trust_all {
            anyhow::bail!("no ws_secrets configured (set WS_SECRET or enable trust_all)");
        }

        if self.chart_max_wait_ms < self.chart_debounce_ms {
            anyhow::bail!(
                "chart_max_wait_ms ({}) must not be less than chart_debounce_ms ({})",
                self.chart_max_wait_ms,
                self.chart_debounce_ms
            );
        }

        if self.peer_port == self.api_port {
            anyhow::bail!("peer_port and api_port must differ (both {})", self.peer_port);
        }

        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be positive");
        }

        if let Some(path) = &self.geoip_database {
            if !path.is_file() {
                anyhow::bail!("geoip_database {} does not exist", path.display());
            }
        }

        Ok(())
    }
}
