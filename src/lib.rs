//! Netium embed - an embeddable proxy core
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! Transport (TCP)
//! → Proxy Protocol (SOCKS5/HTTP)
//! → Router
//! → Proxy Protocol
//! → Stream Layer (TLS)
//! → Transport
//! ```
//!
//! On top of the pipeline sits the embedding bridge: one active instance
//! managed by [`CoreManager`], and [`LatencyProber`] which measures a round
//! trip through a throwaway instance that never listens.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Metadata, Address, Destination
//! ├── config/          # JSON document, build step, engine environment
//! ├── transport/       # Transport layer: TCP, blackhole, TLS
//! ├── protocol/        # Protocol layer: SOCKS5, HTTP, direct
//! ├── router/          # Router: rule-based routing
//! ├── dns/             # Static hosts and cached system resolution
//! ├── app/             # Dispatcher, stacks, Instance, metrics
//! ├── bridge/          # Lifecycle manager, prober, virtual dialer
//! └── api.rs           # Blocking operation surface
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod protocol;
pub mod router;
pub mod dns;
pub mod app;

// Supporting modules
pub mod config;
pub mod bridge;
pub mod api;

// Re-exports for convenience
pub use common::{Address, Destination, Metadata, Network, Stream};
pub use error::{Error, Result};
pub use config::{compile, Config, CoreConfig};

// Architecture re-exports
pub use app::{Dispatcher, Instance, InstanceState, InboundStack, OutboundStack, ResourceLimits};
pub use bridge::{CoreManager, LatencyProber, LogSink, ProbeOptions, ProbeResult, VirtualDialer};
pub use protocol::ProxyProtocol;
pub use router::Router;
pub use transport::Transport;
