//! Transports
//!
//! Raw connection setup (TCP, blackhole) and client-side stream layers (TLS)
//! applied on top of an established connection. No proxy protocol parsing.

mod null;
mod tcp;
mod tls;

pub use null::{BlackholeResponse, BlackholeTransport};
pub use tcp::TcpTransport;
pub use tls::{TlsConfig, TlsLayer};

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Establishes raw connections and listeners
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<Stream>;

    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Next connection and its peer address
    async fn accept(&self) -> Result<(Stream, Address)>;

    fn local_addr(&self) -> Result<Address>;
}

/// A layer applied on top of an established client stream
#[async_trait]
pub trait StreamLayer: Send + Sync {
    async fn wrap_client(&self, stream: Stream) -> Result<Stream>;
}
