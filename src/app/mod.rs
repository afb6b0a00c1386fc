//! Application Layer
//!
//! This module contains:
//! - Instance: a runnable core built from a `CoreConfig`
//! - Dispatcher: core execution flow (inbound → router → outbound)
//! - Stack: inbound/outbound pipeline stacks
//! - Stats: traffic statistics and the Prometheus metrics endpoint
//! - Resources: process-wide memory ceiling

mod dispatcher;
mod instance;
pub mod metrics;
pub mod resources;
mod stack;
pub mod stats;

pub use dispatcher::Dispatcher;
pub use instance::{Instance, InstanceState};
pub use resources::ResourceLimits;
pub use stack::{InboundStack, OutboundStack};
pub use stats::{serve_metrics, StatsCollector};
