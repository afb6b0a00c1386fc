//! Destination - a (network, host, port) dial target
//!
//! Dial hooks hand us a network name and an address string separately.
//! They are joined as `"<network>:<address>"` and parsed here.

use std::str::FromStr;

use super::{Address, Network};
use crate::error::{Error, Result};

/// Resolved target for a connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn tcp(address: Address) -> Self {
        Self {
            network: Network::Tcp,
            address,
        }
    }

    /// Parse `tcp:host:port`, `udp:[v6]:port` or a bare `host:port` (tcp).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::DestinationParse("empty destination".into()));
        }

        let (network, rest) = match s.split_once(':') {
            Some((prefix, rest)) if !prefix.starts_with('[') => match Network::parse(prefix) {
                Some(network) => (network, rest),
                None if rest.contains(':') => {
                    return Err(Error::DestinationParse(format!(
                        "unknown network '{}' in {}",
                        prefix, s
                    )))
                }
                None => (Network::Tcp, s),
            },
            _ => (Network::Tcp, s),
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::DestinationParse(format!("missing port in {}", s)))?;

        if host.is_empty() {
            return Err(Error::DestinationParse(format!("missing host in {}", s)));
        }
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(Error::DestinationParse(format!(
                "IPv6 host must be bracketed in {}",
                s
            )));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| Error::DestinationParse(format!("invalid port '{}' in {}", port, s)))?;

        Ok(Self {
            network,
            address: Address::from_host(host, port),
        })
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.address {
            Address::Socket(addr) => write!(f, "{}:{}", self.network, addr),
            Address::Domain(domain, port) => write!(f, "{}:{}:{}", self.network, domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_prefixed() {
        let dest = Destination::parse("tcp:www.google.com:443").unwrap();
        assert_eq!(dest.network, Network::Tcp);
        assert_eq!(dest.address, Address::domain("www.google.com", 443));

        let dest = Destination::parse("udp:8.8.8.8:53").unwrap();
        assert_eq!(dest.network, Network::Udp);
        assert_eq!(dest.address.as_socket(), Some("8.8.8.8:53".parse().unwrap()));
    }

    #[test]
    fn test_parse_ipv6_and_bare() {
        let dest = Destination::parse("tcp:[2001:db8::1]:8443").unwrap();
        assert_eq!(dest.address.port(), 8443);
        assert!(!dest.address.is_domain());

        let dest = Destination::parse("example.com:80").unwrap();
        assert_eq!(dest.network, Network::Tcp);
        assert_eq!(dest.to_string(), "tcp:example.com:80");
    }

    #[test]
    fn test_parse_failures() {
        for bad in [
            "",
            "tcp:",
            "tcp:example.com",
            "tcp:example.com:http",
            "tcp:example.com:70000",
            "quic:example.com:443",
            "tcp::443",
            "tcp:2001:db8::1:443",
        ] {
            assert!(
                matches!(Destination::parse(bad), Err(Error::DestinationParse(_))),
                "expected parse failure for {:?}",
                bad
            );
        }
    }
}
