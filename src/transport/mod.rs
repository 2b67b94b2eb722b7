//! Peer Transport Module
//!
//! Listens for persistent peer connections on the peer port.
//!
//! ## Protocol
//!
//! 1. Peer connects over TCP
//! 2. Peer sends `hello` with its id, secret and node info
//! 3. Collector replies `ready` (or closes the connection)
//! 4. Peer streams `update`/`block`/`pending`/`stats`/`latency`/`history`/`node-ping`
//! 5. Collector may reply `node-pong` or `history` requests
//! 6. Connection end marks the peer inactive
//!
//! A connection speaks for exactly one peer: reports naming any id other than
//! the one admitted by `hello` are dropped.
//!
//! Every message is one length-prefixed JSON frame (see [`frame`]).

pub mod frame;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

use crate::collector::events::{Inbound, PeerReply};
use crate::collector::{Collector, ConnectionContext};
use crate::config::CollectorConfig;
use crate::types::PeerId;

/// Idle time after which a silent connection is dropped (10 minutes)
const IDLE_TIMEOUT_SECS: u64 = 600;

/// Run the peer receiver
pub async fn run_receiver(config: Arc<CollectorConfig>, collector: Arc<Collector>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.peer_port));
    let listener = TcpListener::bind(addr).await?;

    info!("📡 Peer receiver listening on {}", addr);

    let next_connection = AtomicU64::new(1);

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let context = ConnectionContext {
                    connection: format!("conn-{}", next_connection.fetch_add(1, Ordering::Relaxed)),
                    ip: peer_addr.ip().to_string(),
                    latency: 0,
                };
                let collector = collector.clone();
                let max_size = config.max_message_size;

                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = handle_connection(reader, writer, context, collector, max_size).await {
                        debug!("Connection error from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Serve one peer connection until it closes
pub async fn handle_connection<R, W>(
    mut reader: R,
    mut writer: W,
    context: ConnectionContext,
    collector: Arc<Collector>,
    max_size: usize,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let metrics = collector.metrics();
    metrics.connection_opened();
    debug!("Open: {} ({})", context.ip, context.connection);

    let result = serve(&mut reader, &mut writer, &context, &collector, max_size).await;

    metrics.connection_closed();
    collector.disconnect(&context.connection).await;
    info!("🔌 Connection {} from {} ended", context.connection, context.ip);

    result
}

async fn serve<R, W>(
    reader: &mut R,
    writer: &mut W,
    context: &ConnectionContext,
    collector: &Collector,
    max_size: usize,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let timeout = tokio::time::Duration::from_secs(IDLE_TIMEOUT_SECS);
    // Id admitted by `hello`; every later report must speak for it
    let mut bound: Option<PeerId> = None;

    loop {
        let frame = tokio::time::timeout(timeout, frame::read_frame(reader, max_size))
            .await
            .map_err(|_| anyhow::anyhow!("Connection idle timeout"))??;

        let Some(body) = frame else {
            return Ok(());
        };

        let message: Inbound = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid message from {}: {}", context.ip, e);
                collector.metrics().inc_reports_rejected();
                continue;
            }
        };

        match (&bound, message.peer_id()) {
            (None, _) if !matches!(message, Inbound::Hello(_) | Inbound::NodePing(_)) => {
                trace!("Dropping {} from {} before hello", message.name(), context.ip);
                continue;
            }
            (Some(id), Some(claimed)) if claimed != id.as_str() => {
                warn!(
                    "⚠️  Dropping {} for {} on connection {} bound to {}",
                    message.name(),
                    claimed,
                    context.connection,
                    id
                );
                collector.metrics().inc_reports_rejected();
                continue;
            }
            _ => {}
        }

        let claimed = match &message {
            Inbound::Hello(hello) => hello.id.clone(),
            _ => None,
        };

        let replies = match collector.handle(context, message).await {
            Ok(replies) => replies,
            Err(e) if e.is_fatal_for_connection() => {
                return Err(e.into());
            }
            Err(_) => continue,
        };

        for reply in &replies {
            if matches!(reply, PeerReply::Ready) {
                bound = claimed.clone();
            }
            frame::write_json(writer, reply).await?;
        }
    }
}
