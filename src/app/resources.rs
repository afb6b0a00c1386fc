//! Process-wide resource limits
//!
//! A soft memory ceiling and a collection aggressiveness percentage. There is
//! no tracing collector to tune, so the ceiling bounds per-connection relay
//! buffers and the percentage is recorded and reported through metrics only.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::info;

use super::metrics::{GC_PERCENT, MEMORY_LIMIT_BYTES};

/// Default collection percentage, restored when limits are cleared
pub const DEFAULT_GC_PERCENT: i32 = 100;

/// Default relay buffer per direction
pub const DEFAULT_RELAY_BUFFER: usize = 32 * 1024;

/// Smallest relay buffer a ceiling can force
const MIN_RELAY_BUFFER: usize = 4 * 1024;

/// Share of the ceiling a single relay buffer may take
const RELAY_BUFFER_DIVISOR: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Soft ceiling in bytes; `None` means unlimited
    pub memory_limit: Option<u64>,
    pub gc_percent: i32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit: None,
            gc_percent: DEFAULT_GC_PERCENT,
        }
    }
}

lazy_static! {
    static ref LIMITS: RwLock<ResourceLimits> = RwLock::new(ResourceLimits::default());
}

impl ResourceLimits {
    /// Current process-wide limits
    pub fn current() -> Self {
        *LIMITS.read()
    }

    /// Impose a soft ceiling. Non-positive byte counts leave memory unlimited.
    pub fn set(bytes: i64, gc_percent: i32) {
        let limits = ResourceLimits {
            memory_limit: u64::try_from(bytes).ok().filter(|b| *b > 0),
            gc_percent,
        };
        Self::apply(limits);
    }

    /// Remove the ceiling and restore the default percentage
    pub fn clear() {
        Self::apply(ResourceLimits::default());
    }

    fn apply(limits: ResourceLimits) {
        *LIMITS.write() = limits;
        MEMORY_LIMIT_BYTES.set(limits.memory_limit.map_or(0, |b| b.min(i64::MAX as u64) as i64));
        GC_PERCENT.set(limits.gc_percent as i64);
        info!(
            "Resource limits: memory={:?} gc_percent={}",
            limits.memory_limit, limits.gc_percent
        );
    }

    /// Relay buffer size for a requested size under these limits
    pub fn relay_buffer(&self, requested: Option<usize>) -> usize {
        let size = requested.unwrap_or(DEFAULT_RELAY_BUFFER);
        match self.memory_limit {
            Some(limit) => {
                let cap = (limit / RELAY_BUFFER_DIVISOR).min(usize::MAX as u64) as usize;
                size.min(cap.max(MIN_RELAY_BUFFER))
            }
            None => size,
        }
    }
}
