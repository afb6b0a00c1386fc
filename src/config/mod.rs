//! Configuration module for Netium
//!
//! The JSON document follows the familiar V2Ray layout (`log`, `dns`,
//! `routing`, `inbounds`, `outbounds`, `policy`, `stats`, `fakedns`).
//! It is decoded into [`Config`] and then built into a [`CoreConfig`],
//! the structured form an instance is constructed from.

mod build;
mod core;
mod env;

pub use self::core::{
    AppConfig, AppKind, CoreConfig, DnsSettings, FakeDnsSettings, InboundHandlerConfig,
    InboundProtocolConfig, LogSettings, OutboundHandlerConfig, OutboundProtocolConfig,
    PolicySettings, QueryStrategy, RouterSettings,
};
pub use env::{set_env, snapshot as env_snapshot, EngineEnv, ENGINE_ENV};

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Decode and build a raw configuration buffer
pub fn compile(raw: &[u8]) -> Result<CoreConfig> {
    Config::decode(raw)?.build()
}

/// Main configuration document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log: Option<LogConfig>,

    #[serde(default)]
    pub dns: Option<DnsConfig>,

    #[serde(default)]
    pub routing: Option<RoutingConfig>,

    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,

    #[serde(default)]
    pub policy: Option<PolicyConfig>,

    /// Presence alone enables traffic statistics
    #[serde(default)]
    pub stats: Option<Value>,

    #[serde(default)]
    pub fakedns: Option<FakeDnsConfig>,
}

impl Config {
    /// Parse a configuration document from raw bytes
    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Log configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Accepted and ignored; verbosity comes from `RUST_LOG`
    #[serde(default)]
    pub loglevel: Option<String>,

    /// Access log target; `"none"` disables access logging
    #[serde(default)]
    pub access: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    #[serde(default)]
    pub hosts: HashMap<String, HostValue>,

    /// Upstream servers. Accepted for compatibility, resolution uses the system resolver.
    #[serde(default)]
    pub servers: Vec<Value>,

    #[serde(default)]
    pub query_strategy: Option<String>,
}

/// A static host entry maps to one address or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HostValue {
    One(String),
    Many(Vec<String>),
}

impl HostValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            HostValue::One(s) => vec![s.as_str()],
            HostValue::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

/// Routing rule
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type", default)]
    pub rule_type: Option<String>,

    #[serde(default)]
    pub domain: Vec<String>,

    #[serde(default)]
    pub ip: Vec<String>,

    #[serde(default)]
    pub port: Option<PortValue>,

    /// Comma separated list, e.g. `"tcp,udp"`
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub inbound_tag: Vec<String>,

    #[serde(default)]
    pub protocol: Vec<String>,

    #[serde(default)]
    pub outbound_tag: Option<String>,

    #[serde(default)]
    pub balancer_tag: Option<String>,
}

/// Ports may be written as a number or as a string (`"80"`, `"1000-2000,443"`)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl std::fmt::Display for PortValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Inbound configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    #[serde(default)]
    pub tag: String,

    /// Listen IP, defaults to 0.0.0.0
    #[serde(default)]
    pub listen: Option<String>,

    pub port: PortValue,

    pub protocol: String,

    #[serde(default)]
    pub settings: Option<Value>,
}

/// Outbound configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    #[serde(default)]
    pub tag: String,

    pub protocol: String,

    #[serde(default)]
    pub settings: Option<Value>,

    #[serde(default)]
    pub stream_settings: Option<StreamSettings>,
}

/// Stream (transport) settings of an outbound
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub security: Option<String>,

    #[serde(default)]
    pub tls_settings: Option<TlsSettings>,
}

/// TLS settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub allow_insecure: bool,

    #[serde(default)]
    pub alpn: Vec<String>,

    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateConfig {
    #[serde(default)]
    pub certificate_file: Option<String>,
}

/// Policy configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default)]
    pub levels: HashMap<String, LevelPolicy>,
}

/// Per user level timeouts, in seconds
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
    #[serde(default)]
    pub handshake: Option<u64>,

    #[serde(default)]
    pub conn_idle: Option<u64>,
}

/// Fake DNS may be given as one pool or a list of pools
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FakeDnsConfig {
    One(FakeDnsPool),
    Many(Vec<FakeDnsPool>),
}

impl FakeDnsConfig {
    pub fn pools(&self) -> Vec<&FakeDnsPool> {
        match self {
            FakeDnsConfig::One(pool) => vec![pool],
            FakeDnsConfig::Many(pools) => pools.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FakeDnsPool {
    pub ip_pool: String,

    #[serde(default)]
    pub pool_size: Option<u32>,
}

// Protocol specific `settings` blocks, decoded at build time

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct AccountConfig {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SocksInboundSettings {
    /// `noauth` or `password`
    #[serde(default)]
    pub auth: Option<String>,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct HttpInboundSettings {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ServerListSettings {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerConfig {
    pub address: String,
    pub port: u16,

    #[serde(default)]
    pub users: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BlackholeSettings {
    #[serde(default)]
    pub response: Option<BlackholeResponseConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BlackholeResponseConfig {
    /// `none` or `http`
    #[serde(rename = "type", default)]
    pub response_type: Option<String>,
}
