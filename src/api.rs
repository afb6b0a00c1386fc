//! Blocking operation surface
//!
//! Free functions for hosts that do not run their own async runtime. Every
//! call drives a process-wide tokio runtime and the single [`CoreManager`].
//! These functions block the calling thread and must not be called from
//! inside an async context.

use std::sync::OnceLock;

use lazy_static::lazy_static;
use tokio::runtime::Runtime;
use tracing::info;

use crate::app::ResourceLimits;
use crate::bridge::{CoreManager, LatencyProber, LogSink, ProbeResult};
use crate::config::set_env;
use crate::error::{Error, Result};

lazy_static! {
    static ref MANAGER: CoreManager = CoreManager::new();
    static ref PROBER: LatencyProber = LatencyProber::default();
}

static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

fn runtime() -> Result<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .thread_name("netium-embed")
                .enable_all()
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| Error::Start(format!("runtime unavailable: {}", e)))
}

/// Start `raw` as the active instance, replacing any previous one
pub fn start(raw: &[u8], sink: &dyn LogSink) -> Result<()> {
    runtime()?.block_on(MANAGER.start(raw, sink))
}

/// Stop the active instance
pub fn stop() -> Result<()> {
    runtime()?.block_on(MANAGER.stop())
}

/// Whether an instance is active
pub fn is_running() -> bool {
    MANAGER.is_running()
}

/// Measure one round trip to `url` through `raw`; `-1` with an error on failure
pub fn measure_latency(raw: &[u8], url: &str) -> ProbeResult {
    match runtime() {
        Ok(rt) => rt.block_on(PROBER.measure(raw, url)),
        Err(e) => ProbeResult {
            elapsed_ms: -1,
            error: Some(e),
        },
    }
}

pub fn version() -> String {
    CoreManager::version()
}

/// Impose a soft memory ceiling; non-positive `bytes` leaves memory unlimited
pub fn set_resource_limit(bytes: i64, gc_percent: i32) {
    ResourceLimits::set(bytes, gc_percent);
}

pub fn clear_resource_limit() {
    ResourceLimits::clear();
}

/// Record an engine environment override
pub fn set_path(key: &str, value: &str) {
    info!("Engine env {} = {}", key, value);
    set_env(key, value);
}
