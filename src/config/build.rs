//! Build step: [`Config`] → [`CoreConfig`]
//!
//! Resolves defaults, decodes protocol settings and checks cross references.
//! Application sections are always emitted in the same relative order:
//! fakedns?, log, dispatcher, inbound, outbound, stats?, router, dns, policy?

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use ipnet::IpNet;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::common::{Address, Network};
use crate::error::{Error, Result};
use crate::protocol::{Account, HttpConfig, Socks5Config};
use crate::router::Rule;
use crate::transport::{BlackholeResponse, TlsConfig};

use super::core::{
    AppConfig, CoreConfig, DnsSettings, FakeDnsSettings, InboundHandlerConfig,
    InboundProtocolConfig, LogSettings, OutboundHandlerConfig, OutboundProtocolConfig,
    PolicySettings, QueryStrategy, RouterSettings,
};
use super::env::{self, EngineEnv};
use super::{
    AccountConfig, BlackholeSettings, Config, DnsConfig, FakeDnsConfig, HttpInboundSettings,
    InboundConfig, OutboundConfig, PolicyConfig, RoutingRule, ServerListSettings,
    SocksInboundSettings, StreamSettings,
};

const DEFAULT_FAKEDNS_POOL_SIZE: u32 = 65535;

impl Config {
    /// Build the structured configuration
    pub fn build(&self) -> Result<CoreConfig> {
        let env = env::snapshot();

        check_unique_tags("inbound", self.inbounds.iter().map(|i| i.tag.as_str()))?;
        check_unique_tags("outbound", self.outbounds.iter().map(|o| o.tag.as_str()))?;

        let inbounds = self
            .inbounds
            .iter()
            .map(build_inbound)
            .collect::<Result<Vec<_>>>()?;

        let outbounds = self
            .outbounds
            .iter()
            .map(|o| build_outbound(o, &env))
            .collect::<Result<Vec<_>>>()?;

        let outbound_tags: HashSet<&str> = outbounds.iter().map(|o| o.tag.as_str()).collect();
        let rules = self
            .routing
            .as_ref()
            .map(|r| {
                r.rules
                    .iter()
                    .map(|rule| build_rule(rule, &outbound_tags))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let mut apps = Vec::new();
        if let Some(fakedns) = &self.fakedns {
            apps.push(AppConfig::FakeDns(build_fakedns(fakedns)?));
        }
        apps.push(AppConfig::Log(build_log(self)));
        apps.push(AppConfig::Dispatcher);
        apps.push(AppConfig::InboundManager);
        apps.push(AppConfig::OutboundManager);
        if self.stats.is_some() {
            apps.push(AppConfig::Stats);
        }
        apps.push(AppConfig::Router(RouterSettings { rules }));
        apps.push(AppConfig::Dns(build_dns(self.dns.as_ref())?));
        if let Some(policy) = &self.policy {
            apps.push(AppConfig::Policy(build_policy(policy)));
        }

        debug!(
            "Built config: {} inbounds, {} outbounds, {} app sections",
            inbounds.len(),
            outbounds.len(),
            apps.len()
        );

        Ok(CoreConfig {
            inbounds,
            outbounds,
            apps,
        })
    }
}

fn check_unique_tags<'a>(kind: &str, tags: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for tag in tags.filter(|t| !t.is_empty()) {
        if !seen.insert(tag) {
            return Err(Error::Build(format!("duplicate {} tag: {}", kind, tag)));
        }
    }
    Ok(())
}

/// Decode a protocol `settings` block; absent settings decode from `{}`
fn settings<T: DeserializeOwned + Default>(value: &Option<Value>, what: &str) -> Result<T> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| Error::Build(format!("invalid {} settings: {}", what, e))),
    }
}

fn accounts(list: &[AccountConfig]) -> Vec<Account> {
    list.iter()
        .map(|a| Account {
            user: a.user.clone(),
            pass: a.pass.clone(),
        })
        .collect()
}

fn build_inbound(config: &InboundConfig) -> Result<InboundHandlerConfig> {
    let ip: IpAddr = match config.listen.as_deref() {
        None | Some("") => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Some(listen) => listen
            .parse()
            .map_err(|_| Error::Build(format!("[{}] invalid listen address: {}", config.tag, listen)))?,
    };

    let port: u16 = config
        .port
        .to_string()
        .trim()
        .parse()
        .map_err(|_| Error::Build(format!("[{}] invalid inbound port: {}", config.tag, config.port)))?;

    let protocol = match config.protocol.as_str() {
        "socks" | "socks5" => {
            let s: SocksInboundSettings = settings(&config.settings, "socks")?;
            let accounts = match s.auth.as_deref() {
                None | Some("noauth") => Vec::new(),
                Some("password") => {
                    if s.accounts.is_empty() {
                        return Err(Error::Build(format!(
                            "[{}] password auth requires accounts",
                            config.tag
                        )));
                    }
                    accounts(&s.accounts)
                }
                Some(other) => {
                    return Err(Error::Build(format!("[{}] unknown socks auth: {}", config.tag, other)))
                }
            };
            InboundProtocolConfig::Socks(Socks5Config { accounts })
        }
        "http" => {
            let s: HttpInboundSettings = settings(&config.settings, "http")?;
            InboundProtocolConfig::Http(HttpConfig {
                accounts: accounts(&s.accounts),
            })
        }
        other => {
            return Err(Error::Build(format!(
                "[{}] unsupported inbound protocol: {}",
                config.tag, other
            )))
        }
    };

    Ok(InboundHandlerConfig {
        tag: config.tag.clone(),
        listen: SocketAddr::new(ip, port),
        protocol,
    })
}

fn build_outbound(config: &OutboundConfig, env: &EngineEnv) -> Result<OutboundHandlerConfig> {
    let protocol = match config.protocol.as_str() {
        "freedom" | "direct" => OutboundProtocolConfig::Freedom,
        "blackhole" => {
            let s: BlackholeSettings = settings(&config.settings, "blackhole")?;
            let response = match s.response.and_then(|r| r.response_type) {
                None => BlackholeResponse::None,
                Some(kind) => BlackholeResponse::parse(&kind).ok_or_else(|| {
                    Error::Build(format!(
                        "[{}] unknown blackhole response: {}",
                        config.tag, kind
                    ))
                })?,
            };
            OutboundProtocolConfig::Blackhole { response }
        }
        "socks" | "http" => {
            let s: ServerListSettings = settings(&config.settings, &config.protocol)?;
            let server = s.servers.first().ok_or_else(|| {
                Error::Build(format!("[{}] {} outbound requires a server", config.tag, config.protocol))
            })?;
            let address = Address::from_host(&server.address, server.port);
            let accounts = accounts(&server.users);
            if config.protocol == "socks" {
                OutboundProtocolConfig::Socks {
                    server: address,
                    config: Socks5Config { accounts },
                }
            } else {
                OutboundProtocolConfig::Http {
                    server: address,
                    config: HttpConfig { accounts },
                }
            }
        }
        other => {
            return Err(Error::Build(format!(
                "[{}] unsupported outbound protocol: {}",
                config.tag, other
            )))
        }
    };

    let tls = match &config.stream_settings {
        Some(stream) => build_stream(&config.tag, stream, &protocol, env)?,
        None => None,
    };

    Ok(OutboundHandlerConfig {
        tag: config.tag.clone(),
        protocol,
        tls,
    })
}

fn build_stream(
    tag: &str,
    stream: &StreamSettings,
    protocol: &OutboundProtocolConfig,
    env: &EngineEnv,
) -> Result<Option<TlsConfig>> {
    match stream.network.as_deref() {
        None | Some("") | Some("tcp") | Some("raw") => {}
        Some(other) => {
            return Err(Error::Build(format!("[{}] unsupported network: {}", tag, other)))
        }
    }

    match stream.security.as_deref() {
        None | Some("") | Some("none") => Ok(None),
        Some("tls") => {
            let settings = stream.tls_settings.clone().unwrap_or_default();
            let server_name = settings.server_name.clone().or_else(|| match protocol {
                OutboundProtocolConfig::Socks { server, .. }
                | OutboundProtocolConfig::Http { server, .. } => Some(server.host()),
                _ => None,
            });
            if server_name.is_none() {
                return Err(Error::Build(format!("[{}] tls requires serverName", tag)));
            }

            Ok(Some(TlsConfig {
                server_name,
                allow_insecure: settings.allow_insecure,
                alpn: settings.alpn.clone(),
                certificates: settings
                    .certificates
                    .iter()
                    .filter_map(|c| c.certificate_file.as_deref())
                    .map(|file| env.resolve_cert(file))
                    .collect(),
            }))
        }
        Some(other) => Err(Error::Build(format!("[{}] unsupported security: {}", tag, other))),
    }
}

fn build_rule(rule: &RoutingRule, outbound_tags: &HashSet<&str>) -> Result<Rule> {
    if let Some(rule_type) = rule.rule_type.as_deref() {
        if rule_type != "field" {
            return Err(Error::Build(format!("unsupported rule type: {}", rule_type)));
        }
    }

    if let Some(balancer) = &rule.balancer_tag {
        return Err(Error::Build(format!("balancers are not supported: {}", balancer)));
    }

    let outbound_tag = rule
        .outbound_tag
        .clone()
        .ok_or_else(|| Error::Build("routing rule has no outboundTag".into()))?;
    if !outbound_tags.contains(outbound_tag.as_str()) {
        return Err(Error::Build(format!(
            "routing rule references unknown outbound: {}",
            outbound_tag
        )));
    }

    let network = match &rule.network {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|n| Network::parse(n).ok_or_else(|| Error::Build(format!("unknown network: {}", n))))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    // geoip: and ext: lists are accepted and never match
    for ip in rule.ip.iter().filter(|ip| !ip.starts_with("geoip:") && !ip.starts_with("ext:")) {
        if ip.parse::<IpAddr>().is_err() && ip.parse::<IpNet>().is_err() {
            return Err(Error::Build(format!("invalid ip in rule: {}", ip)));
        }
    }

    Ok(Rule {
        inbound_tag: rule.inbound_tag.clone(),
        protocol: rule.protocol.clone(),
        network,
        domain: rule.domain.clone(),
        ip: rule.ip.clone(),
        port: rule.port.as_ref().map(|p| p.to_string()),
        outbound_tag,
    })
}

fn build_dns(config: Option<&DnsConfig>) -> Result<DnsSettings> {
    let Some(config) = config else {
        return Ok(DnsSettings::default());
    };

    let mut hosts = HashMap::new();
    for (domain, value) in &config.hosts {
        let ips = value
            .values()
            .into_iter()
            .map(|v| {
                v.parse::<IpAddr>()
                    .map_err(|_| Error::Build(format!("dns host {} maps to non-IP value {}", domain, v)))
            })
            .collect::<Result<Vec<_>>>()?;
        hosts.insert(domain.trim_end_matches('.').to_ascii_lowercase(), ips);
    }

    let strategy = match config.query_strategy.as_deref() {
        None | Some("") => QueryStrategy::default(),
        Some(s) => QueryStrategy::parse(s)
            .ok_or_else(|| Error::Build(format!("unknown queryStrategy: {}", s)))?,
    };

    Ok(DnsSettings { hosts, strategy })
}

fn build_policy(config: &PolicyConfig) -> PolicySettings {
    let defaults = PolicySettings::default();
    match config.levels.get("0") {
        Some(level) => PolicySettings {
            handshake: level
                .handshake
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake),
            conn_idle: level
                .conn_idle
                .map(Duration::from_secs)
                .unwrap_or(defaults.conn_idle),
        },
        None => defaults,
    }
}

fn build_fakedns(config: &FakeDnsConfig) -> Result<FakeDnsSettings> {
    let pools = config
        .pools()
        .into_iter()
        .map(|pool| {
            let net: IpNet = pool
                .ip_pool
                .parse()
                .map_err(|_| Error::Build(format!("invalid fakedns ipPool: {}", pool.ip_pool)))?;
            Ok((net, pool.pool_size.unwrap_or(DEFAULT_FAKEDNS_POOL_SIZE)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FakeDnsSettings { pools })
}

fn build_log(config: &Config) -> LogSettings {
    let log = config.log.clone().unwrap_or_default();
    LogSettings {
        access: !matches!(log.access.as_deref(), Some("none")),
    }
}
