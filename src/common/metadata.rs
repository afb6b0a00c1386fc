//! Connection metadata
//!
//! Everything routing may look at. Produced by inbound protocol parsing or
//! by an internal dial, never by reading the stream afterwards.

use std::fmt;

use super::{Address, Destination};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl Network {
    /// Accepts the names dial hooks use, address family suffixes included
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Some(Network::Tcp),
            "udp" | "udp4" | "udp6" => Some(Network::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Metadata {
    /// Peer of an inbound connection; unspecified for internal dials
    pub source: Address,
    pub destination: Address,
    pub network: Network,
    /// Empty for internal dials
    pub inbound_tag: String,
    /// Inbound protocol that produced this metadata (socks, http)
    pub protocol: String,
}

impl Metadata {
    pub fn new(destination: Address) -> Self {
        Self {
            source: Address::unspecified(),
            destination,
            network: Network::Tcp,
            inbound_tag: String::new(),
            protocol: String::new(),
        }
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_inbound_tag(mut self, tag: impl Into<String>) -> Self {
        self.inbound_tag = tag.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new(Address::unspecified())
    }
}

/// Metadata of an internal dial: no inbound, no source
impl From<&Destination> for Metadata {
    fn from(destination: &Destination) -> Self {
        Metadata::new(destination.address.clone()).with_network(destination.network)
    }
}
