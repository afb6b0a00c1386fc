//! Rule-based Router implementation

use std::net::IpAddr;

use regex::Regex;
use tracing::warn;

use crate::common::{Address, Metadata, Network};

use super::{Route, Router};

/// Routing rule
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Match inbound tags
    pub inbound_tag: Vec<String>,
    /// Match protocols
    pub protocol: Vec<String>,
    /// Match networks
    pub network: Vec<Network>,
    /// Match domain patterns
    pub domain: Vec<String>,
    /// Match IP patterns
    pub ip: Vec<String>,
    /// Match port patterns ("80", "80,443", "1000-2000")
    pub port: Option<String>,
    /// Target outbound tag
    pub outbound_tag: String,
}

/// Rule-based router
pub struct RuleRouter {
    rules: Vec<CompiledRule>,
    default_outbound: String,
}

/// Rule with its regexp domain patterns compiled once up front
struct CompiledRule {
    rule: Rule,
    regexes: Vec<Regex>,
}

impl RuleRouter {
    pub fn new(rules: Vec<Rule>, default_outbound: impl Into<String>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let regexes = rule
                    .domain
                    .iter()
                    .filter_map(|p| p.strip_prefix("regexp:"))
                    .filter_map(|re| match Regex::new(re) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!("Ignoring invalid domain regexp '{}': {}", re, e);
                            None
                        }
                    })
                    .collect();
                CompiledRule { rule, regexes }
            })
            .collect();

        Self {
            rules,
            default_outbound: default_outbound.into(),
        }
    }

    /// Check if a rule matches the metadata
    fn match_rule(&self, compiled: &CompiledRule, metadata: &Metadata) -> bool {
        let rule = &compiled.rule;

        if !rule.inbound_tag.is_empty()
            && !rule.inbound_tag.iter().any(|t| t == &metadata.inbound_tag)
        {
            return false;
        }

        if !rule.protocol.is_empty() && !rule.protocol.iter().any(|p| p == &metadata.protocol) {
            return false;
        }

        if !rule.network.is_empty() && !rule.network.contains(&metadata.network) {
            return false;
        }

        if let Some(port_pattern) = &rule.port {
            if !match_port(port_pattern, metadata.destination.port()) {
                return false;
            }
        }

        let has_domain_rules = !rule.domain.is_empty();
        let has_ip_rules = !rule.ip.is_empty();

        if !has_domain_rules && !has_ip_rules {
            return true;
        }

        match &metadata.destination {
            Address::Domain(domain, _) => {
                has_domain_rules && match_domain(&rule.domain, &compiled.regexes, domain)
            }
            Address::Socket(addr) => has_ip_rules && match_ip(&rule.ip, addr.ip()),
        }
    }
}

/// Match port pattern (e.g., "80", "80,443", "1000-2000")
fn match_port(pattern: &str, port: u16) -> bool {
    for part in pattern.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<u16>(), end.trim().parse::<u16>()) {
                if port >= start && port <= end {
                    return true;
                }
            }
        } else if let Ok(p) = part.parse::<u16>() {
            if port == p {
                return true;
            }
        }
    }
    false
}

/// Match domain patterns
fn match_domain(patterns: &[String], regexes: &[Regex], domain: &str) -> bool {
    let domain_lower = domain.to_lowercase();

    if regexes.iter().any(|re| re.is_match(&domain_lower)) {
        return true;
    }

    patterns.iter().any(|pattern| {
        if let Some(target) = pattern.strip_prefix("domain:") {
            domain_lower == target || domain_lower.ends_with(&format!(".{}", target))
        } else if let Some(target) = pattern.strip_prefix("full:") {
            domain_lower == target
        } else if let Some(keyword) = pattern.strip_prefix("keyword:") {
            domain_lower.contains(keyword)
        } else if pattern.starts_with("regexp:")
            || pattern.starts_with("geosite:")
            || pattern.starts_with("ext:")
        {
            // regexps were checked above; geo databases are not loaded
            false
        } else {
            domain_lower.contains(pattern.as_str())
        }
    })
}

/// Match IP patterns
fn match_ip(patterns: &[String], ip: IpAddr) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.starts_with("geoip:") || pattern.starts_with("ext:") {
            false
        } else if pattern.contains('/') {
            pattern
                .parse::<ipnet::IpNet>()
                .map(|network| network.contains(&ip))
                .unwrap_or(false)
        } else {
            pattern
                .parse::<IpAddr>()
                .map(|target| target == ip)
                .unwrap_or(false)
        }
    })
}

impl Router for RuleRouter {
    fn route(&self, metadata: &Metadata) -> Route<'_> {
        self.rules
            .iter()
            .position(|compiled| self.match_rule(compiled, metadata))
            .map(|index| Route::Rule(index, &self.rules[index].rule.outbound_tag))
            .unwrap_or(Route::Default(&self.default_outbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_router_domain() {
        let rules = vec![Rule {
            domain: vec!["domain:google.com".to_string()],
            outbound_tag: "proxy".to_string(),
            ..Default::default()
        }];

        let router = RuleRouter::new(rules, "direct");

        let meta1 = Metadata::new(Address::domain("www.google.com", 443));
        assert_eq!(router.select(&meta1), "proxy");

        let meta2 = Metadata::new(Address::domain("example.com", 443));
        assert_eq!(router.select(&meta2), "direct");
    }

    #[test]
    fn test_rule_router_port() {
        let rules = vec![Rule {
            port: Some("443,8000-8100".to_string()),
            outbound_tag: "proxy".to_string(),
            ..Default::default()
        }];

        let router = RuleRouter::new(rules, "direct");

        assert_eq!(router.select(&Metadata::new(Address::domain("a.com", 443))), "proxy");
        assert_eq!(router.select(&Metadata::new(Address::domain("a.com", 8080))), "proxy");
        assert_eq!(router.select(&Metadata::new(Address::domain("a.com", 80))), "direct");
    }

    #[test]
    fn test_rule_router_ip_and_regexp() {
        let rules = vec![
            Rule {
                ip: vec!["10.0.0.0/8".to_string(), "geoip:private".to_string()],
                outbound_tag: "lan".to_string(),
                ..Default::default()
            },
            Rule {
                domain: vec!["regexp:^api\\.".to_string()],
                outbound_tag: "api".to_string(),
                ..Default::default()
            },
        ];

        let router = RuleRouter::new(rules, "direct");

        let lan = Metadata::new(Address::Socket("10.1.2.3:22".parse().unwrap()));
        assert_eq!(router.select(&lan), "lan");

        let api = Metadata::new(Address::domain("api.example.com", 443));
        assert_eq!(router.route(&api), Route::Rule(1, "api"));

        let wan = Metadata::new(Address::Socket("1.1.1.1:443".parse().unwrap()));
        assert_eq!(router.route(&wan), Route::Default("direct"));
    }

    #[test]
    fn test_rule_router_inbound_and_network() {
        let rules = vec![Rule {
            inbound_tag: vec!["socks-in".to_string()],
            network: vec![Network::Udp],
            outbound_tag: "block".to_string(),
            ..Default::default()
        }];

        let router = RuleRouter::new(rules, "direct");

        let udp = Metadata::new(Address::domain("example.com", 53))
            .with_network(Network::Udp)
            .with_inbound_tag("socks-in");
        assert_eq!(router.select(&udp), "block");

        let tcp = Metadata::new(Address::domain("example.com", 53)).with_inbound_tag("socks-in");
        assert_eq!(router.select(&tcp), "direct");
    }
}
