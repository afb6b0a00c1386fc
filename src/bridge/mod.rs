//! Embedding bridge
//!
//! The pieces an embedding application talks to:
//! - CoreManager: the single active instance
//! - LatencyProber: scratch instances that measure one round trip
//! - VirtualDialer: dials through an instance instead of the OS
//! - LogSink: where lifecycle failures are reported

mod dialer;
mod lifecycle;
mod log;
mod probe;

pub use dialer::VirtualDialer;
pub use lifecycle::{CoreManager, CORE_VERSION, LIB_VERSION};
pub use log::{LogSink, TracingSink};
pub use probe::{LatencyProber, ProbeOptions, ProbeResult, ProbeStats, DEFAULT_PROBE_URL};
