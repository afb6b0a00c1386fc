//! Prometheus-based metrics module
//!
//! All metrics live in one registry and are exposed via the /metrics endpoint
//! when the binary serves it.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};

use crate::router::Route;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Dispatcher Metrics ===

    pub static ref DISPATCHER_CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "netium_dispatcher_connections_total",
        "Total number of connections handled by dispatcher"
    ).unwrap();

    pub static ref DISPATCHER_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "netium_dispatcher_connections_active",
        "Number of currently active connections"
    ).unwrap();

    pub static ref DISPATCHER_CONNECTIONS_FAILED: IntCounter = IntCounter::new(
        "netium_dispatcher_connections_failed",
        "Total number of failed connections"
    ).unwrap();

    // === Traffic Metrics ===

    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "netium_traffic_bytes_uploaded_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "netium_traffic_bytes_downloaded_total",
        "Total bytes downloaded"
    ).unwrap();

    // === Inbound Metrics ===

    pub static ref INBOUND_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netium_inbound_connections_total", "Total connections per inbound"),
        &["tag"]
    ).unwrap();

    pub static ref INBOUND_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netium_inbound_connections_active", "Active connections per inbound"),
        &["tag"]
    ).unwrap();

    // === Outbound Metrics ===

    pub static ref OUTBOUND_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netium_outbound_connections_total", "Total connections per outbound"),
        &["tag"]
    ).unwrap();

    pub static ref OUTBOUND_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netium_outbound_connections_active", "Active connections per outbound"),
        &["tag"]
    ).unwrap();

    pub static ref OUTBOUND_BYTES_UPLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("netium_outbound_bytes_uploaded_total", "Bytes uploaded per outbound"),
        &["tag"]
    ).unwrap();

    pub static ref OUTBOUND_BYTES_DOWNLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("netium_outbound_bytes_downloaded_total", "Bytes downloaded per outbound"),
        &["tag"]
    ).unwrap();

    /// Connection duration histogram
    pub static ref CONNECTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "netium_connection_duration_seconds",
            "Connection duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["outbound"]
    ).unwrap();

    // === Routing Metrics ===

    /// Routing decisions per outbound, by how the outbound was chosen ("rule", "default")
    pub static ref ROUTE_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netium_route_decisions_total", "Routing decisions per outbound"),
        &["outbound", "by"]
    ).unwrap();

    // === Instance Metrics ===

    pub static ref INSTANCES_RUNNING: IntGauge = IntGauge::new(
        "netium_instances_running",
        "Number of running instances, scratch probe instances included"
    ).unwrap();

    // === Probe Metrics ===

    /// Probes by result ("success", "failure")
    pub static ref PROBES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netium_probes_total", "Latency probes by result"),
        &["result"]
    ).unwrap();

    pub static ref PROBE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "netium_probe_latency_seconds",
            "Round trip of successful latency probes"
        ).buckets(vec![0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0, 5.0, 12.0])
    ).unwrap();

    // === Resource Metrics ===

    /// Soft memory ceiling in bytes, 0 when unset
    pub static ref MEMORY_LIMIT_BYTES: IntGauge = IntGauge::new(
        "netium_memory_limit_bytes",
        "Configured soft memory ceiling"
    ).unwrap();

    pub static ref GC_PERCENT: IntGauge = IntGauge::new(
        "netium_gc_percent",
        "Configured collection aggressiveness percentage"
    ).unwrap();
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() {
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_FAILED.clone())).ok();

    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone())).ok();

    REGISTRY.register(Box::new(INBOUND_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(INBOUND_CONNECTIONS_ACTIVE.clone())).ok();

    REGISTRY.register(Box::new(OUTBOUND_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_BYTES_DOWNLOADED.clone())).ok();

    REGISTRY.register(Box::new(CONNECTION_DURATION_SECONDS.clone())).ok();

    REGISTRY.register(Box::new(ROUTE_DECISIONS_TOTAL.clone())).ok();

    REGISTRY.register(Box::new(INSTANCES_RUNNING.clone())).ok();

    REGISTRY.register(Box::new(PROBES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(PROBE_LATENCY_SECONDS.clone())).ok();

    REGISTRY.register(Box::new(MEMORY_LIMIT_BYTES.clone())).ok();
    REGISTRY.register(Box::new(GC_PERCENT.clone())).ok();
}

/// Helper struct for tracking a single connection's metrics
pub struct ConnectionMetrics {
    outbound_tag: String,
    start_time: std::time::Instant,
}

impl ConnectionMetrics {
    pub fn new(outbound_tag: &str) -> Self {
        Self {
            outbound_tag: outbound_tag.to_string(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Record connection completion with duration
    pub fn record_completion(&self) {
        let duration = self.start_time.elapsed().as_secs_f64();
        CONNECTION_DURATION_SECONDS
            .with_label_values(&[&self.outbound_tag])
            .observe(duration);
    }
}

pub fn record_route(route: &Route<'_>) {
    let by = match route {
        Route::Rule(..) => "rule",
        Route::Default(_) => "default",
    };
    ROUTE_DECISIONS_TOTAL.with_label_values(&[route.tag(), by]).inc();
}

/// Record the outcome of one latency probe
pub fn record_probe(elapsed: Option<std::time::Duration>) {
    match elapsed {
        Some(elapsed) => {
            PROBES_TOTAL.with_label_values(&["success"]).inc();
            PROBE_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
        }
        None => PROBES_TOTAL.with_label_values(&["failure"]).inc(),
    }
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    const TB: u64 = 1024 * 1024 * 1024 * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
