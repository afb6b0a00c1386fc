//! Routing
//!
//! Picks the outbound tag for a connection from its [`Metadata`] alone.
//! Routers never touch the network; resolution happens in the outbound.

pub mod rule_router;

pub use rule_router::{Rule, RuleRouter};

use std::fmt;

use crate::common::Metadata;

/// Outcome of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Matched the rule at this position
    Rule(usize, &'a str),
    /// No rule matched; the default outbound takes it
    Default(&'a str),
}

impl<'a> Route<'a> {
    pub fn tag(&self) -> &'a str {
        match self {
            Route::Rule(_, tag) | Route::Default(tag) => tag,
        }
    }
}

impl fmt::Display for Route<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Rule(index, tag) => write!(f, "[{}] by rule #{}", tag, index),
            Route::Default(tag) => write!(f, "[{}] by default", tag),
        }
    }
}

/// Routing seam between inbound parsing and outbound selection
pub trait Router: Send + Sync {
    fn route(&self, metadata: &Metadata) -> Route<'_>;

    /// Outbound tag for `metadata`
    fn select(&self, metadata: &Metadata) -> &str {
        self.route(metadata).tag()
    }
}

/// Sends everything to the default outbound; used when no rules are configured
pub struct DefaultRouter {
    outbound: String,
}

impl DefaultRouter {
    pub fn new(outbound: impl Into<String>) -> Self {
        Self {
            outbound: outbound.into(),
        }
    }
}

impl Router for DefaultRouter {
    fn route(&self, _metadata: &Metadata) -> Route<'_> {
        Route::Default(&self.outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    #[test]
    fn test_default_router() {
        let router = DefaultRouter::new("proxy");
        let metadata = Metadata::new(Address::domain("example.com", 443));
        assert_eq!(router.route(&metadata), Route::Default("proxy"));
        assert_eq!(router.select(&metadata), "proxy");
        assert_eq!(router.route(&metadata).to_string(), "[proxy] by default");
    }
}
