//! Collector Service
//!
//! Applies decoded peer messages to the shared [`Registry`] and publishes the
//! resulting events to display clients.
//!
//! ## Flow
//!
//! 1. Transport decodes one [`Inbound`] message from a peer connection
//! 2. Collector takes the registry write lock, applies it, releases the lock
//! 3. Changed snapshots go out on the broadcast channel as [`Outbound`]
//! 4. Direct answers ([`PeerReply`]) go back to the transport
//!
//! Chart recompute requests are coalesced by [`Debounce`] and served by
//! [`Collector::run_chart_loop`].

pub mod auth;
pub mod events;
pub mod throttle;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::api::Metrics;
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::registry::geo::{GeoLocator, MaxMindLocator, StaticGeoTable};
use crate::registry::{Identification, Registry, TrustPolicy};
use crate::types::{now_millis, Update};

use auth::Gate;
use events::{Hello, Inbound, Outbound, PeerReply};
use throttle::Debounce;

/// Facts the transport knows about a peer connection
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Unique per connection
    pub connection: String,
    /// Remote address, as seen by the listener
    pub ip: String,
    /// Transport-measured round trip (ms)
    pub latency: u64,
}

/// The single writer in front of the registry
pub struct Collector {
    registry: Arc<RwLock<Registry>>,
    gate: Gate,
    geo: Arc<dyn GeoLocator>,
    events: broadcast::Sender<Outbound>,
    debounce: Mutex<Debounce>,
    chart_wakeup: Notify,
    metrics: Arc<Metrics>,
}

impl Collector {
    pub fn new(config: &CollectorConfig, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let table = StaticGeoTable::new(config.geo_table.clone());
        let geo: Arc<dyn GeoLocator> = match &config.geoip_database {
            Some(path) => Arc::new(MaxMindLocator::open(path, table)?),
            None => Arc::new(table),
        };
        Ok(Self::with_locator(config, metrics, geo))
    }

    pub fn with_locator(
        config: &CollectorConfig,
        metrics: Arc<Metrics>,
        geo: Arc<dyn GeoLocator>,
    ) -> Self {
        let trust = TrustPolicy::new(config.trusted_ips.iter().cloned(), config.trust_all);
        let gate = Gate::new(
            config.ws_secrets.iter().cloned(),
            config.banned_ips.iter().cloned(),
            config.reserved_ids.iter().cloned(),
        );
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        Self {
            registry: Arc::new(RwLock::new(Registry::new(trust))),
            gate,
            geo,
            events,
            debounce: Mutex::new(Debounce::new(
                Duration::from_millis(config.chart_debounce_ms),
                Duration::from_millis(config.chart_max_wait_ms),
            )),
            chart_wakeup: Notify::new(),
            metrics,
        }
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Receive every outbound event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.events.subscribe()
    }

    /// Apply one inbound message, returning replies for the sending peer
    pub async fn handle(
        &self,
        context: &ConnectionContext,
        message: Inbound,
    ) -> Result<Vec<PeerReply>, CollectorError> {
        self.metrics.inc_reports_received();
        let name = message.name();

        let result = self.dispatch(context, message).await;
        if let Err(error) = &result {
            if error.is_fatal_for_connection() {
                self.metrics.inc_auth_rejected();
            } else {
                self.metrics.inc_reports_rejected();
            }
            warn!("⚠️  {} from {} rejected: {}", name, context.ip, error);
        }
        result
    }

    async fn dispatch(
        &self,
        context: &ConnectionContext,
        message: Inbound,
    ) -> Result<Vec<PeerReply>, CollectorError> {
        match message {
            Inbound::Hello(hello) => self.hello(context, hello).await,

            Inbound::Update(message) => {
                let stats = message.stats.ok_or(CollectorError::StatsUndefined)?;
                let update = self
                    .registry
                    .write()
                    .await
                    .update_peer_status(&message.id, &stats, now_millis())?;

                if let Some(snapshot) = update.changed() {
                    debug!("Update from {}", message.id);
                    self.broadcast(Outbound::Update(snapshot));
                    self.request_charts().await;
                }
                Ok(vec![])
            }

            Inbound::Block(message) => {
                let block = message.block.ok_or(CollectorError::BlockUndefined)?;
                let outcome = self
                    .registry
                    .write()
                    .await
                    .add_block(&message.id, &block, now_millis())?;

                if let Some(number) = outcome.new_highest {
                    self.broadcast(Outbound::LastBlock { number });
                }
                if outcome.ledger_changed {
                    self.metrics.inc_blocks_accepted();
                }
                if let Update::Changed(snapshot) = outcome.update {
                    info!(
                        "🧱 Block {} from {} (propagation {}ms)",
                        snapshot.block.number, message.id, snapshot.block.propagation
                    );
                    self.broadcast(Outbound::Block(snapshot));
                    self.request_charts().await;
                } else if outcome.ledger_changed {
                    self.request_charts().await;
                }
                Ok(vec![])
            }

            Inbound::Pending(message) => {
                let stats = message.stats.ok_or(CollectorError::StatsUndefined)?;
                let update = self.registry.write().await.add_pending(&message.id, &stats)?;

                if let Some(snapshot) = update.changed() {
                    trace!("Pending {} from {}", snapshot.pending, message.id);
                    self.broadcast(Outbound::Pending(snapshot));
                }
                Ok(vec![])
            }

            Inbound::Stats(message) => {
                let stats = message.stats.ok_or(CollectorError::StatsUndefined)?;
                let update = self
                    .registry
                    .write()
                    .await
                    .update_basic_stats(&message.id, &stats, now_millis())?;

                if let Some(snapshot) = update.changed() {
                    debug!("Stats from {}", message.id);
                    self.broadcast(Outbound::Stats(snapshot));
                }
                Ok(vec![])
            }

            Inbound::History(message) => {
                let count = message.history.len();
                let changed = self
                    .registry
                    .write()
                    .await
                    .ingest_backfill(&message.id, message.history, now_millis())?;

                info!("📚 History from {}: {} blocks, {} new", message.id, count, changed);
                self.request_charts().await;
                Ok(vec![])
            }

            Inbound::NodePing(ping) => {
                trace!("Ping from {:?}", ping.id);
                Ok(vec![PeerReply::NodePong {
                    client_time: ping.client_time,
                    server_time: now_millis(),
                }])
            }

            Inbound::Latency(message) => {
                let now = now_millis();
                let (update, range) = {
                    let mut registry = self.registry.write().await;
                    let update = registry.update_latency(&message.id, message.latency)?;

                    let mut range = None;
                    if registry.should_request_backfill(&message.id, now) {
                        range = registry.backfill_range();
                        if range.is_some() {
                            registry.mark_backfill_requested(now);
                        }
                    }
                    (update, range)
                };

                if let Some(snapshot) = update.changed() {
                    self.broadcast(Outbound::Latency(snapshot));
                }

                match range {
                    Some(range) => {
                        info!("📜 Asked {} for history {}..{}", message.id, range.min, range.max);
                        self.metrics.inc_backfill_requests();
                        Ok(vec![PeerReply::History(range)])
                    }
                    None => Ok(vec![]),
                }
            }
        }
    }

    async fn hello(
        &self,
        context: &ConnectionContext,
        hello: Hello,
    ) -> Result<Vec<PeerReply>, CollectorError> {
        let id = self.gate.check(&hello, &context.ip)?;

        let Some(info) = hello.info else {
            warn!("Hello from {} without info, ignoring", id);
            return Ok(vec![]);
        };

        let location = self.geo.locate(&context.ip);
        let identification = Identification {
            info: Some(info),
            ip: Some(context.ip.clone()),
            connection: Some(context.connection.clone()),
            latency: Some(context.latency),
        };

        let snapshot = self
            .registry
            .write()
            .await
            .add_peer(&id, identification, location, now_millis());

        info!("🤝 Peer {} connected from {}", id, context.ip);
        self.broadcast(Outbound::Add(snapshot));
        Ok(vec![PeerReply::Ready])
    }

    /// Connection ended: mark its peer inactive
    pub async fn disconnect(&self, connection: &str) {
        let result = self.registry.write().await.mark_inactive(connection, now_millis());

        match result {
            Ok(snapshot) => self.broadcast(Outbound::Inactive(snapshot)),
            Err(error) => debug!("Connection {} ended before hello: {}", connection, error),
        }
    }

    /// Evict stale peers and broadcast the full list
    pub async fn refresh_peer_list(&self) {
        let now = now_millis();
        let (removed, nodes) = {
            let mut registry = self.registry.write().await;
            let removed = registry.evict_stale(now);
            (removed, registry.list_active_peers(now))
        };

        for id in removed {
            self.broadcast(Outbound::Removed { id });
        }

        self.metrics.set_active_peers(nodes.iter().filter(|n| n.stats.active).count() as u64);
        debug!("Broadcasting peer list ({} peers)", nodes.len());
        self.broadcast(Outbound::Init { nodes });
        self.request_charts().await;
    }

    pub async fn run_peer_list_loop(self: Arc<Self>, period: Duration) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            self.refresh_peer_list().await;
        }
    }

    /// Ask for a chart recompute; bursts are coalesced
    pub async fn request_charts(&self) {
        self.debounce.lock().await.request(Instant::now());
        self.chart_wakeup.notify_one();
    }

    /// Serve coalesced chart recompute requests forever
    pub async fn run_chart_loop(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let deadline = self.debounce.lock().await.deadline();

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.chart_wakeup.notified() => continue,
                    }
                }
                None => {
                    self.chart_wakeup.notified().await;
                    continue;
                }
            }

            if self.debounce.lock().await.fire_if_due(Instant::now()) {
                self.publish_charts().await;
            }
        }
    }

    /// Compute charts from a consistent snapshot and broadcast them
    pub async fn publish_charts(&self) {
        let (charts, best) = {
            let registry = self.registry.read().await;
            (registry.charts(), registry.best_block_number())
        };

        self.metrics.inc_chart_recomputes();
        self.metrics.set_best_height(best);
        trace!("Charts computed at height {}", best);
        self.broadcast(Outbound::Charts(Box::new(charts)));
    }

    fn broadcast(&self, event: Outbound) {
        let name = event.name();
        if self.events.send(event).is_err() {
            trace!("No subscribers for {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::events::{BlockMessage, LatencyMessage, PingMessage, StatsMessage};
    use crate::ledger::tests::create_test_block;
    use crate::registry::geo::GeoEntry;
    use crate::types::{BasicStats, NodeInfo};

    fn create_test_collector() -> Collector {
        let config = CollectorConfig {
            ws_secrets: vec!["secret".to_string()],
            trusted_ips: vec!["10.0.0.1".to_string()],
            reserved_ids: vec!["admin".to_string()],
            chart_debounce_ms: 10,
            chart_max_wait_ms: 50,
            geo_table: vec![GeoEntry {
                prefix: "10.0.".to_string(),
                country: "US".to_string(),
                region: "CA".to_string(),
                city: "San Jose".to_string(),
                ll: (37.3, -121.9),
            }],
            ..CollectorConfig::default()
        };
        Collector::new(&config, Arc::new(Metrics::new())).unwrap()
    }

    fn context(connection: &str, ip: &str) -> ConnectionContext {
        ConnectionContext {
            connection: connection.to_string(),
            ip: ip.to_string(),
            latency: 3,
        }
    }

    fn hello(id: &str) -> Inbound {
        Inbound::Hello(Hello {
            id: Some(id.to_string()),
            secret: Some("secret".to_string()),
            info: Some(NodeInfo {
                name: Some(id.to_string()),
                ..Default::default()
            }),
        })
    }

    fn block(id: &str, number: u64, hash: &str) -> Inbound {
        Inbound::Block(BlockMessage {
            id: id.to_string(),
            block: Some(create_test_block(number, hash)),
        })
    }

    #[tokio::test]
    async fn test_hello_adds_peer_and_replies_ready() {
        let collector = create_test_collector();
        let mut events = collector.subscribe();

        let replies = collector.handle(&context("c1", "::ffff:10.0.0.1"), hello("node-1")).await.unwrap();
        assert_eq!(replies, vec![PeerReply::Ready]);

        match events.recv().await.unwrap() {
            Outbound::Add(snapshot) => {
                assert_eq!(snapshot.id, "node-1");
                assert_eq!(snapshot.info.ip.as_deref(), Some("10.0.0.1"));
                assert_eq!(snapshot.stats.latency, 3);
                assert_eq!(snapshot.geo.map(|geo| geo.country).as_deref(), Some("US"));
            }
            other => panic!("unexpected {:?}", other.name()),
        }
        assert!(collector.registry().read().await.get("node-1").unwrap().is_trusted());
    }

    #[test]
    fn test_unreadable_geoip_database_fails_startup() {
        let config = CollectorConfig {
            trust_all: true,
            geoip_database: Some("/nonexistent/GeoLite2-City.mmdb".into()),
            ..CollectorConfig::default()
        };
        assert!(Collector::new(&config, Arc::new(Metrics::new())).is_err());
    }

    #[tokio::test]
    async fn test_hello_rejected_by_gate() {
        let collector = create_test_collector();

        let error = collector.handle(&context("c1", "1.2.3.4"), hello("admin")).await.unwrap_err();
        assert!(error.is_fatal_for_connection());
        assert!(collector.registry().read().await.get("admin").is_none());
    }

    #[tokio::test]
    async fn test_block_emits_last_block_then_block() {
        let collector = create_test_collector();
        let ctx = context("c1", "10.0.0.1");
        collector.handle(&ctx, hello("node-1")).await.unwrap();

        let mut events = collector.subscribe();
        collector.handle(&ctx, block("node-1", 42, "0x2a")).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), Outbound::LastBlock { number: 42 }));
        match events.recv().await.unwrap() {
            Outbound::Block(snapshot) => assert_eq!(snapshot.block.number, 42),
            other => panic!("unexpected {:?}", other.name()),
        }

        // Same block again: no new events
        collector.handle(&ctx, block("node-1", 42, "0x2a")).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_peer_and_missing_payloads() {
        let collector = create_test_collector();
        let ctx = context("c1", "10.0.0.9");

        assert_eq!(
            collector.handle(&ctx, block("ghost", 1, "0x1")).await.unwrap_err(),
            CollectorError::NodeNotFound
        );

        let missing = Inbound::Stats(StatsMessage { id: "ghost".into(), stats: None });
        assert_eq!(collector.handle(&ctx, missing).await.unwrap_err(), CollectorError::StatsUndefined);
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let collector = create_test_collector();
        let ping = Inbound::NodePing(PingMessage {
            id: Some("node-1".into()),
            client_time: Some(serde_json::json!(1234)),
        });

        let replies = collector.handle(&context("c1", "1.1.1.1"), ping).await.unwrap();
        match &replies[..] {
            [PeerReply::NodePong { client_time, server_time }] => {
                assert_eq!(client_time, &Some(serde_json::json!(1234)));
                assert!(*server_time > 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_latency_triggers_single_backfill_request() {
        let collector = create_test_collector();
        let ctx = context("c1", "10.0.0.1");
        collector.handle(&ctx, hello("node-1")).await.unwrap();
        collector.handle(&ctx, block("node-1", 98, "0x62")).await.unwrap();
        collector.handle(&ctx, block("node-1", 100, "0x64")).await.unwrap();

        let latency = |ms| {
            Inbound::Latency(LatencyMessage {
                id: "node-1".into(),
                latency: Some(ms),
            })
        };

        let replies = collector.handle(&ctx, latency(20)).await.unwrap();
        match &replies[..] {
            [PeerReply::History(range)] => {
                assert_eq!(range.max, 99);
                assert!(range.list.contains(&99));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Cooldown: the next report does not ask again
        assert!(collector.handle(&ctx, latency(25)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_marks_inactive() {
        let collector = create_test_collector();
        collector.handle(&context("c7", "10.0.0.3"), hello("node-7")).await.unwrap();

        let mut events = collector.subscribe();
        collector.disconnect("c7").await;

        match events.recv().await.unwrap() {
            Outbound::Inactive(snapshot) => {
                assert_eq!(snapshot.id, "node-7");
                assert!(!snapshot.stats.active);
            }
            other => panic!("unexpected {:?}", other.name()),
        }

        // Unknown connection: nothing broadcast
        collector.disconnect("nope").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_update_broadcast() {
        let collector = create_test_collector();
        let ctx = context("c1", "10.0.0.5");
        collector.handle(&ctx, hello("node-1")).await.unwrap();

        let mut events = collector.subscribe();
        let stats = Inbound::Stats(StatsMessage {
            id: "node-1".into(),
            stats: Some(BasicStats {
                active: true,
                mining: true,
                peers: 9,
                ..Default::default()
            }),
        });
        collector.handle(&ctx, stats).await.unwrap();

        match events.recv().await.unwrap() {
            Outbound::Stats(snapshot) => {
                assert!(snapshot.stats.mining);
                assert_eq!(snapshot.stats.peers, 9);
            }
            other => panic!("unexpected {:?}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_chart_loop_coalesces_requests() {
        let collector = Arc::new(create_test_collector());
        let mut events = collector.subscribe();
        tokio::spawn(collector.clone().run_chart_loop());

        for _ in 0..5 {
            collector.request_charts().await;
        }

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "charts");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err(), "a burst yields one recompute");
        assert_eq!(
            collector.metrics().chart_recomputes.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_refresh_peer_list_broadcasts_init() {
        let collector = create_test_collector();
        collector.handle(&context("c1", "10.0.0.1"), hello("node-1")).await.unwrap();

        let mut events = collector.subscribe();
        collector.refresh_peer_list().await;

        match events.recv().await.unwrap() {
            Outbound::Init { nodes } => assert_eq!(nodes.len(), 1),
            other => panic!("unexpected {:?}", other.name()),
        }
    }
}
