//! Dispatcher - Core Execution Flow
//!
//! The dispatcher handles the flow: inbound → router → outbound
//!
//! ```text
//! InboundStack.process() → (Metadata, Stream)
//!                               ↓
//!                      Router.route(Metadata)
//!                               ↓
//!                      OutboundStack.connect()
//!                               ↓
//!                      Bidirectional Relay (idle bounded)
//! ```
//!
//! `dial` is the first half only and is what in-process callers use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::common::{Metadata, Result, Stream};
use crate::error::Error;
use crate::router::Router;

use super::metrics::{
    format_bytes, record_route, ConnectionMetrics, OUTBOUND_BYTES_DOWNLOADED, OUTBOUND_BYTES_UPLOADED,
};
use super::resources::ResourceLimits;
use super::stack::OutboundStack;
use super::stats::{DispatcherStats, StatsCollector};

/// Dispatcher routes connections to outbounds
///
/// The Dispatcher is protocol-agnostic - it only works with Stream and Metadata.
pub struct Dispatcher {
    router: Arc<dyn Router>,
    outbounds: HashMap<String, Arc<OutboundStack>>,
    stats: DispatcherStats,
    collector: Option<Arc<StatsCollector>>,
    conn_idle: Duration,
    /// Relay buffer requested by the engine environment
    relay_buffer: Option<usize>,
    access_log: bool,
}

impl Dispatcher {
    pub fn new(router: Arc<dyn Router>, outbounds: HashMap<String, Arc<OutboundStack>>) -> Self {
        Self {
            router,
            outbounds,
            stats: DispatcherStats,
            collector: None,
            conn_idle: Duration::from_secs(300),
            relay_buffer: None,
            access_log: true,
        }
    }

    pub fn with_stats(mut self, collector: Arc<StatsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_conn_idle(mut self, idle: Duration) -> Self {
        self.conn_idle = idle;
        self
    }

    pub fn with_relay_buffer(mut self, bytes: Option<usize>) -> Self {
        self.relay_buffer = bytes;
        self
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    pub fn collector(&self) -> Option<&Arc<StatsCollector>> {
        self.collector.as_ref()
    }

    /// Route and connect, returning the outbound stream and the chosen tag
    pub async fn dial(&self, metadata: &Metadata) -> Result<(Stream, String)> {
        let route = self.router.route(metadata);
        record_route(&route);
        let tag = route.tag().to_string();
        let outbound = self
            .outbounds
            .get(&tag)
            .ok_or_else(|| Error::Transport(format!("no outbound for tag '{}'", tag)))?;

        debug!(
            "[{}] Routing {} -> {} via {}",
            metadata.inbound_tag, metadata.source, metadata.destination, route
        );

        let stream = outbound.connect(metadata).await?;
        Ok((stream, tag))
    }

    /// Dispatch an inbound connection: dial, then relay until either side
    /// closes or the connection stays idle for `conn_idle`
    pub async fn dispatch(&self, metadata: Metadata, inbound_stream: Stream) -> Result<()> {
        let start = Instant::now();
        self.stats.connection_start();

        let (outbound_stream, tag) = match self.dial(&metadata).await {
            Ok(dialed) => dialed,
            Err(e) => {
                self.stats.connection_failed();
                return Err(e);
            }
        };

        let outbound_stat = self.collector.as_ref().and_then(|c| c.outbound(&tag));
        if let Some(stat) = &outbound_stat {
            stat.connection_start();
        }

        if self.access_log {
            info!(
                "[{}] {} -> {} via [{}]",
                metadata.inbound_tag, metadata.source, metadata.destination, tag
            );
        }

        let conn_metrics = ConnectionMetrics::new(&tag);
        let buffer = ResourceLimits::current().relay_buffer(self.relay_buffer);
        let (up, down) = relay(inbound_stream, outbound_stream, &tag, buffer, self.conn_idle).await;

        conn_metrics.record_completion();
        self.stats.connection_end(up, down);
        if let Some(stat) = &outbound_stat {
            stat.connection_end();
        }

        debug!(
            "[{}] Closed: {} -> {} (↑{} ↓{} {:?})",
            metadata.inbound_tag,
            metadata.source,
            metadata.destination,
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );

        Ok(())
    }
}

// ============================================================================
// Relay Implementation
// ============================================================================

/// Copy one direction, counting bytes and touching the shared activity clock
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    buffer: usize,
    total: &AtomicU64,
    last_activity: &Mutex<Instant>,
    on_chunk: impl Fn(u64),
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        total.fetch_add(n as u64, Ordering::Relaxed);
        *last_activity.lock() = Instant::now();
        on_chunk(n as u64);
    }

    let _ = writer.shutdown().await;
}

/// Relay data bidirectionally; returns (uploaded, downloaded)
async fn relay(
    inbound: Stream,
    outbound: Stream,
    outbound_tag: &str,
    buffer: usize,
    idle: Duration,
) -> (u64, u64) {
    let (in_read, in_write) = tokio::io::split(inbound);
    let (out_read, out_write) = tokio::io::split(outbound);

    let uploaded = AtomicU64::new(0);
    let downloaded = AtomicU64::new(0);
    let last_activity = Mutex::new(Instant::now());

    let upload = copy_half(in_read, out_write, buffer, &uploaded, &last_activity, |n| {
        OUTBOUND_BYTES_UPLOADED.with_label_values(&[outbound_tag]).inc_by(n)
    });
    let download = copy_half(out_read, in_write, buffer, &downloaded, &last_activity, |n| {
        OUTBOUND_BYTES_DOWNLOADED.with_label_values(&[outbound_tag]).inc_by(n)
    });

    let watchdog = async {
        loop {
            let deadline = *last_activity.lock() + idle;
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
    };

    tokio::select! {
        _ = async { tokio::join!(upload, download) } => {}
        _ = watchdog => debug!("[{}] Connection idle for {:?}, closing", outbound_tag, idle),
    }

    (
        uploaded.load(Ordering::Relaxed),
        downloaded.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::protocol::DirectProtocol;
    use crate::router::DefaultRouter;
    use crate::transport::{BlackholeTransport, TcpTransport};
    use tokio::net::TcpListener;

    fn dispatcher(tag: &str, stack: OutboundStack) -> Dispatcher {
        let mut outbounds = HashMap::new();
        outbounds.insert(tag.to_string(), Arc::new(stack));
        Dispatcher::new(Arc::new(DefaultRouter::new(tag)), outbounds)
    }

    #[tokio::test]
    async fn test_dispatch_relays_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let d = dispatcher(
            "direct",
            OutboundStack::new("direct", Arc::new(TcpTransport::new()), Arc::new(DirectProtocol)),
        );

        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            d.dispatch(Metadata::new(Address::Socket(addr)), Box::new(server)).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let d = dispatcher(
            "block",
            OutboundStack::new("block", Arc::new(BlackholeTransport::new()), Arc::new(DirectProtocol)),
        )
        .with_conn_idle(Duration::from_millis(100));

        let (_client, server) = tokio::io::duplex(1024);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            d.dispatch(Metadata::new(Address::domain("example.com", 80)), Box::new(server)),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_dial_unknown_tag() {
        let d = Dispatcher::new(Arc::new(DefaultRouter::new("missing")), HashMap::new());
        let result = d.dial(&Metadata::new(Address::domain("example.com", 80))).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
