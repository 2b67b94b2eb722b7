//! API Routes
//!
//! HTTP endpoints for health, peer and chart snapshots, the live event stream
//! and metrics.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::Metrics;
use crate::collector::events::Outbound;
use crate::collector::Collector;
use crate::config::CollectorConfig;
use crate::types::now_millis;

/// Shared API state
pub struct ApiState {
    pub collector: Arc<Collector>,
    pub metrics: Arc<Metrics>,
}

/// Build the router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/status", get(get_status))

        // Snapshots
        .route("/nodes", get(get_nodes))
        .route("/charts", get(get_charts))

        // Live events
        .route("/events", get(event_stream))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(
    config: Arc<CollectorConfig>,
    collector: Arc<Collector>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState { collector, metrics });
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("📊 HTTP API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /health - Simple health check
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// GET /status - Registry summary
async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.collector.registry().read().await.stats();

    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "registry": stats,
    }))
}

/// GET /nodes - Current peer list (stale peers are evicted first)
async fn get_nodes(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let nodes = state
        .collector
        .registry()
        .write()
        .await
        .list_active_peers(now_millis());

    Json(serde_json::json!({
        "count": nodes.len(),
        "nodes": nodes,
    }))
}

/// GET /charts - Chart bundle computed on demand
async fn get_charts(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let charts = state.collector.registry().read().await.charts();
    Json(charts)
}

/// GET /events - Outbound events as server-sent events
///
/// Opens with `init` carrying the current peer list and asks for a fresh
/// chart bundle; deltas follow.
async fn event_stream(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.collector.subscribe();
    let nodes = state
        .collector
        .registry()
        .write()
        .await
        .list_active_peers(now_millis());
    state.collector.request_charts().await;

    debug!("SSE client connected, sending {} nodes", nodes.len());
    let init = stream::iter([Ok(sse_event(&Outbound::Init { nodes }))]);

    let updates = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(outbound) => return Some((Ok(sse_event(&outbound)), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(init.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn sse_event(outbound: &Outbound) -> Event {
    match Event::default().event(outbound.name()).json_data(outbound) {
        Ok(event) => event,
        Err(err) => {
            warn!(?err, "failed to encode {} for SSE", outbound.name());
            Event::default().event(outbound.name())
        }
    }
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_gauges(&state).await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_gauges(&state).await;

    Json(state.metrics.to_json())
}

async fn refresh_gauges(state: &ApiState) {
    let stats = state.collector.registry().read().await.stats();
    state.metrics.set_active_peers(stats.active_peers as u64);
    state.metrics.set_best_height(stats.best_height);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::collector::events::{Hello, Inbound};
    use crate::collector::ConnectionContext;
    use crate::types::NodeInfo;

    fn create_test_state() -> Arc<ApiState> {
        let config = CollectorConfig {
            ws_secrets: vec!["secret".to_string()],
            chart_debounce_ms: 10,
            chart_max_wait_ms: 50,
            ..CollectorConfig::default()
        };
        let metrics = Arc::new(Metrics::new());
        Arc::new(ApiState {
            collector: Arc::new(Collector::new(&config, metrics.clone()).unwrap()),
            metrics,
        })
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_status_format() {
        let status = get_json(router(create_test_state()), "/status").await;

        assert_eq!(status["status"], "healthy");
        assert_eq!(status["registry"]["total_peers"], 0);
    }

    #[tokio::test]
    async fn test_empty_charts_and_nodes() {
        let state = create_test_state();

        let charts = get_json(router(state.clone()), "/charts").await;
        assert_eq!(charts["avgHashrate"], 0.0);
        assert_eq!(charts["propagation"]["histogram"].as_array().unwrap().len(), 40);

        let nodes = get_json(router(state), "/nodes").await;
        assert_eq!(nodes["count"], 0);
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let response = router(create_test_state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("netstats_best_height 0"));
    }

    #[tokio::test]
    async fn test_event_stream_opens_with_peer_list_and_charts() {
        let state = create_test_state();
        let context = ConnectionContext {
            connection: "conn-1".to_string(),
            ip: "10.0.0.1".to_string(),
            latency: 0,
        };
        let hello = Inbound::Hello(Hello {
            id: Some("node-1".to_string()),
            secret: Some("secret".to_string()),
            info: Some(NodeInfo::default()),
        });
        state.collector.handle(&context, hello).await.unwrap();

        let mut events = state.collector.subscribe();
        tokio::spawn(state.collector.clone().run_chart_loop());

        let response = router(state.clone())
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with("event: init"), "got {}", text);
        assert!(text.contains(r#""id":"node-1""#));

        // Connecting asked for a chart recompute
        let charts = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(charts.name(), "charts");
    }
}
