//! Structured runtime configuration
//!
//! `CoreConfig` is what an instance is built from. It is produced once by
//! [`Config::build`](super::Config::build) and treated as immutable afterwards.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipnet::IpNet;

use crate::common::Address;
use crate::protocol::{HttpConfig, Socks5Config};
use crate::router::Rule;
use crate::transport::{BlackholeResponse, TlsConfig};

/// Compiled configuration: handlers plus the ordered application sections
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub inbounds: Vec<InboundHandlerConfig>,
    pub outbounds: Vec<OutboundHandlerConfig>,
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone)]
pub struct InboundHandlerConfig {
    pub tag: String,
    pub listen: SocketAddr,
    pub protocol: InboundProtocolConfig,
}

#[derive(Debug, Clone)]
pub enum InboundProtocolConfig {
    Socks(Socks5Config),
    Http(HttpConfig),
}

#[derive(Debug, Clone)]
pub struct OutboundHandlerConfig {
    pub tag: String,
    pub protocol: OutboundProtocolConfig,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub enum OutboundProtocolConfig {
    Freedom,
    Blackhole { response: BlackholeResponse },
    Socks { server: Address, config: Socks5Config },
    Http { server: Address, config: HttpConfig },
}

impl OutboundProtocolConfig {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundProtocolConfig::Freedom => "freedom",
            OutboundProtocolConfig::Blackhole { .. } => "blackhole",
            OutboundProtocolConfig::Socks { .. } => "socks",
            OutboundProtocolConfig::Http { .. } => "http",
        }
    }
}

/// Application section kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppKind {
    FakeDns,
    Log,
    Dispatcher,
    InboundManager,
    OutboundManager,
    Stats,
    Router,
    Dns,
    Policy,
}

impl AppKind {
    /// Sections a listener-less probe instance keeps
    pub fn is_probe_essential(self) -> bool {
        matches!(
            self,
            AppKind::Dispatcher
                | AppKind::InboundManager
                | AppKind::OutboundManager
                | AppKind::Router
                | AppKind::Dns
        )
    }
}

/// One application section
#[derive(Debug, Clone)]
pub enum AppConfig {
    FakeDns(FakeDnsSettings),
    Log(LogSettings),
    Dispatcher,
    InboundManager,
    OutboundManager,
    Stats,
    Router(RouterSettings),
    Dns(DnsSettings),
    Policy(PolicySettings),
}

impl AppConfig {
    pub fn kind(&self) -> AppKind {
        match self {
            AppConfig::FakeDns(_) => AppKind::FakeDns,
            AppConfig::Log(_) => AppKind::Log,
            AppConfig::Dispatcher => AppKind::Dispatcher,
            AppConfig::InboundManager => AppKind::InboundManager,
            AppConfig::OutboundManager => AppKind::OutboundManager,
            AppConfig::Stats => AppKind::Stats,
            AppConfig::Router(_) => AppKind::Router,
            AppConfig::Dns(_) => AppKind::Dns,
            AppConfig::Policy(_) => AppKind::Policy,
        }
    }
}

/// Process log verbosity is set by the host (`RUST_LOG`), not the config
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub access: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    pub rules: Vec<Rule>,
}

/// Which address families the resolver returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryStrategy {
    #[default]
    UseIp,
    UseIpv4,
    UseIpv6,
}

impl QueryStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "useip" => Some(QueryStrategy::UseIp),
            "useipv4" => Some(QueryStrategy::UseIpv4),
            "useipv6" => Some(QueryStrategy::UseIpv6),
            _ => None,
        }
    }

    pub fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            QueryStrategy::UseIp => true,
            QueryStrategy::UseIpv4 => ip.is_ipv4(),
            QueryStrategy::UseIpv6 => ip.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsSettings {
    /// Lowercased domain to static addresses
    pub hosts: HashMap<String, Vec<IpAddr>>,
    pub strategy: QueryStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    pub handshake: Duration,
    pub conn_idle: Duration,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(4),
            conn_idle: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeDnsSettings {
    pub pools: Vec<(IpNet, u32)>,
}

impl CoreConfig {
    /// Reduced copy for a listener-less probe instance
    ///
    /// Inbounds are cleared and application sections are filtered by kind,
    /// so the relative order of the kept sections is unchanged.
    pub fn probe_only(&self) -> CoreConfig {
        CoreConfig {
            inbounds: Vec::new(),
            outbounds: self.outbounds.clone(),
            apps: self
                .apps
                .iter()
                .filter(|app| app.kind().is_probe_essential())
                .cloned()
                .collect(),
        }
    }

    pub fn app_kinds(&self) -> Vec<AppKind> {
        self.apps.iter().map(AppConfig::kind).collect()
    }

    pub fn has_app(&self, kind: AppKind) -> bool {
        self.apps.iter().any(|app| app.kind() == kind)
    }

    pub fn router(&self) -> Option<&RouterSettings> {
        self.apps.iter().find_map(|app| match app {
            AppConfig::Router(settings) => Some(settings),
            _ => None,
        })
    }

    pub fn dns(&self) -> Option<&DnsSettings> {
        self.apps.iter().find_map(|app| match app {
            AppConfig::Dns(settings) => Some(settings),
            _ => None,
        })
    }

    pub fn policy(&self) -> Option<&PolicySettings> {
        self.apps.iter().find_map(|app| match app {
            AppConfig::Policy(settings) => Some(settings),
            _ => None,
        })
    }

    pub fn log(&self) -> Option<&LogSettings> {
        self.apps.iter().find_map(|app| match app {
            AppConfig::Log(settings) => Some(settings),
            _ => None,
        })
    }

    pub fn fake_dns(&self) -> Option<&FakeDnsSettings> {
        self.apps.iter().find_map(|app| match app {
            AppConfig::FakeDns(settings) => Some(settings),
            _ => None,
        })
    }
}
