//! Traffic statistics and the Prometheus metrics HTTP endpoint

use std::collections::HashMap;
use std::sync::Arc;

use axum::{http::header::CONTENT_TYPE, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::metrics::{
    init_metrics, DISPATCHER_CONNECTIONS_ACTIVE, DISPATCHER_CONNECTIONS_FAILED,
    DISPATCHER_CONNECTIONS_TOTAL, INBOUND_CONNECTIONS_ACTIVE, INBOUND_CONNECTIONS_TOTAL,
    OUTBOUND_BYTES_DOWNLOADED, OUTBOUND_BYTES_UPLOADED, OUTBOUND_CONNECTIONS_ACTIVE,
    OUTBOUND_CONNECTIONS_TOTAL, REGISTRY, TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED,
};

/// Dispatcher-level statistics (wrapper for prometheus metrics)
#[derive(Default)]
pub struct DispatcherStats;

impl DispatcherStats {
    pub fn connection_start(&self) {
        DISPATCHER_CONNECTIONS_TOTAL.inc();
        DISPATCHER_CONNECTIONS_ACTIVE.inc();
    }

    pub fn connection_end(&self, uploaded: u64, downloaded: u64) {
        DISPATCHER_CONNECTIONS_ACTIVE.dec();
        TRAFFIC_BYTES_UPLOADED.inc_by(uploaded);
        TRAFFIC_BYTES_DOWNLOADED.inc_by(downloaded);
    }

    pub fn connection_failed(&self) {
        DISPATCHER_CONNECTIONS_ACTIVE.dec();
        DISPATCHER_CONNECTIONS_FAILED.inc();
    }
}

/// Per-inbound statistics
pub struct InboundStats {
    tag: String,
}

impl InboundStats {
    fn new(tag: &str) -> Self {
        // Pre-initialize the label so it appears in metrics
        INBOUND_CONNECTIONS_TOTAL.with_label_values(&[tag]).inc_by(0);
        INBOUND_CONNECTIONS_ACTIVE.with_label_values(&[tag]).set(0);
        Self { tag: tag.to_string() }
    }

    pub fn connection_accepted(&self) {
        INBOUND_CONNECTIONS_TOTAL.with_label_values(&[&self.tag]).inc();
        INBOUND_CONNECTIONS_ACTIVE.with_label_values(&[&self.tag]).inc();
    }

    pub fn connection_closed(&self) {
        INBOUND_CONNECTIONS_ACTIVE.with_label_values(&[&self.tag]).dec();
    }
}

/// Per-outbound statistics
pub struct OutboundStats {
    tag: String,
}

impl OutboundStats {
    fn new(tag: &str) -> Self {
        OUTBOUND_CONNECTIONS_TOTAL.with_label_values(&[tag]).inc_by(0);
        OUTBOUND_CONNECTIONS_ACTIVE.with_label_values(&[tag]).set(0);
        OUTBOUND_BYTES_UPLOADED.with_label_values(&[tag]).inc_by(0);
        OUTBOUND_BYTES_DOWNLOADED.with_label_values(&[tag]).inc_by(0);
        Self { tag: tag.to_string() }
    }

    pub fn connection_start(&self) {
        OUTBOUND_CONNECTIONS_TOTAL.with_label_values(&[&self.tag]).inc();
        OUTBOUND_CONNECTIONS_ACTIVE.with_label_values(&[&self.tag]).inc();
    }

    pub fn connection_end(&self) {
        OUTBOUND_CONNECTIONS_ACTIVE.with_label_values(&[&self.tag]).dec();
    }
}

/// Statistics handles for one instance, present when the `stats` section is configured
pub struct StatsCollector {
    inbounds: HashMap<String, Arc<InboundStats>>,
    outbounds: HashMap<String, Arc<OutboundStats>>,
}

impl StatsCollector {
    pub fn new<'a>(
        inbound_tags: impl IntoIterator<Item = &'a str>,
        outbound_tags: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        init_metrics();

        Self {
            inbounds: inbound_tags
                .into_iter()
                .map(|tag| (tag.to_string(), Arc::new(InboundStats::new(tag))))
                .collect(),
            outbounds: outbound_tags
                .into_iter()
                .map(|tag| (tag.to_string(), Arc::new(OutboundStats::new(tag))))
                .collect(),
        }
    }

    pub fn inbound(&self, tag: &str) -> Option<Arc<InboundStats>> {
        self.inbounds.get(tag).cloned()
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<OutboundStats>> {
        self.outbounds.get(tag).cloned()
    }
}

/// Encode the registry in the Prometheus text format
pub fn render_metrics() -> prometheus::Result<Vec<u8>> {
    init_metrics();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Prometheus metrics endpoint
async fn get_metrics() -> impl IntoResponse {
    match render_metrics() {
        Ok(buffer) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            e.to_string().into_bytes(),
        ),
    }
}

/// Build the metrics router
pub fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(get_metrics))
}

/// Serve /metrics on an already bound listener until shutdown
pub async fn serve_metrics(listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Prometheus metrics server listening on http://{}/metrics", addr);
    }

    axum::serve(listener, build_metrics_router())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Metrics server shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Metrics server error: {}", e);
        });
}
