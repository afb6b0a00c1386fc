//! Proxy protocols
//!
//! A protocol turns an accepted stream into [`Metadata`] plus a payload
//! stream (inbound), or performs the client handshake on a connected stream
//! (outbound). Authentication lives here; connection setup does not.

mod direct;
mod http;
mod socks5;

pub use direct::DirectProtocol;
pub use http::HttpProtocol;
pub use socks5::Socks5Protocol;

use async_trait::async_trait;

use crate::common::{Metadata, Result, Stream};

/// Both directions of one proxy protocol
#[async_trait]
pub trait ProxyProtocol: Send + Sync {
    /// Server side: authenticate, read the target, and hand back the
    /// stream positioned at the first payload byte
    async fn inbound(&self, stream: Stream) -> Result<(Metadata, Stream)>;

    /// Client side: ask the server on `stream` to connect to
    /// `metadata.destination`
    async fn outbound(&self, stream: Stream, metadata: &Metadata) -> Result<Stream>;

    fn name(&self) -> &'static str;
}

/// Username/password pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    pub pass: String,
}

/// SOCKS5 configuration
///
/// Inbound: any listed account is accepted; no accounts means no auth.
/// Outbound: the first account is presented to the server.
#[derive(Debug, Clone, Default)]
pub struct Socks5Config {
    pub accounts: Vec<Account>,
}

/// HTTP proxy configuration, same account semantics as SOCKS5
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    pub accounts: Vec<Account>,
}
