//! Network Stats Collector
//!
//! Live telemetry aggregator for a fleet of blockchain nodes. Nodes keep a
//! connection open and stream status, block and propagation reports; the
//! collector reconciles them into one bounded block history with forks and
//! propagation timing, and publishes peer snapshots and charts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   NETSTATS COLLECTOR                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Peer Receiver (3000)   ←── Nodes stream reports (TCP/JSON) │
//! │  Collector              ←── Single writer over the registry │
//! │  Registry + Ledger      ←── Peers, forks, propagation       │
//! │  Chart Loop             ←── Debounced chart recompute       │
//! │  HTTP API (3001)        ←── Snapshots, SSE events, metrics  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod api;
mod collector;
mod config;
mod error;
mod ledger;
mod registry;
mod transport;
mod types;

use api::Metrics;
use collector::Collector;
use config::CollectorConfig;

/// Network stats collector - aggregates node telemetry
#[derive(Parser, Debug)]
#[command(name = "netstats-collector")]
#[command(version)]
#[command(about = "Live telemetry collector for blockchain node fleets", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "collector.toml")]
    config: PathBuf,

    /// Peer connection port
    #[arg(long)]
    peer_port: Option<u16>,

    /// HTTP API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Shared secrets accepted from nodes, `|`-separated
    #[arg(long, env = "WS_SECRET", value_delimiter = '|', hide_env_values = true)]
    ws_secret: Vec<String>,

    /// Trust every node (lite mode)
    #[arg(long, env = "LITE")]
    lite: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into())
        )
        .init();

    info!("🌐 Netstats Collector v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if args.config.exists() {
        CollectorConfig::load(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        CollectorConfig::default()
    };

    // Override config with CLI args and environment
    let config = config
        .with_peer_port(args.peer_port)
        .with_api_port(args.api_port)
        .with_secrets(args.ws_secret)
        .with_trust_all(args.lite);

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   Peer port: {}", config.peer_port);
    info!("   API port: {}", config.api_port);
    info!("   Secrets: {}", config.ws_secrets.len());
    info!("   Trusted IPs: {}", config.trusted_ips.len());
    info!("   Trust all: {}", config.trust_all);
    match &config.geoip_database {
        Some(path) => info!("   GeoIP database: {}", path.display()),
        None => info!("   GeoIP database: none ({} static entries)", config.geo_table.len()),
    }
    info!("   Charts: {}ms debounce, {}ms max wait", config.chart_debounce_ms, config.chart_max_wait_ms);

    let shared_config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());
    let collector = Arc::new(Collector::new(&shared_config, metrics.clone())?);

    // Start all services concurrently
    let receiver_handle = tokio::spawn(transport::run_receiver(
        shared_config.clone(),
        collector.clone(),
    ));

    let api_handle = tokio::spawn(api::run_api_server(
        shared_config.clone(),
        collector.clone(),
        metrics.clone(),
    ));

    let chart_handle = tokio::spawn(collector.clone().run_chart_loop());

    let peer_list_handle = tokio::spawn(
        collector
            .clone()
            .run_peer_list_loop(Duration::from_secs(shared_config.peer_list_refresh_secs.max(1))),
    );

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = receiver_handle => {
            error!("Peer receiver exited: {:?}", result);
        }
        result = api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
        result = chart_handle => {
            error!("Chart loop exited: {:?}", result);
        }
        result = peer_list_handle => {
            error!("Peer list loop exited: {:?}", result);
        }
    }

    let stats = collector.registry().read().await.stats();
    info!(
        "👋 Netstats Collector shutting down ({} peers, best block {})",
        stats.total_peers, stats.best_height
    );
    Ok(())
}
