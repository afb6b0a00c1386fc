//! Host and port of a connection endpoint

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A resolved socket address, or a domain that an outbound still has to resolve
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// `0.0.0.0:0`, where no address is known
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
    }

    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// IP literals become socket addresses, anything else a domain.
    /// IPv6 brackets are optional.
    pub fn from_host(host: &str, port: u16) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Host without port, IPv6 literals unbracketed
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(..))
    }

    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(..) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => addr.fmt(f),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
