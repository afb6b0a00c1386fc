//! Pipeline Stacks
//!
//! InboundStack: Transport → Protocol (inbound)
//! OutboundStack: Transport → StreamLayer → Protocol (outbound)

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{Address, Metadata, Network, Result, Stream};
use crate::dns::DnsClient;
use crate::error::Error;
use crate::protocol::ProxyProtocol;
use crate::transport::{StreamLayer, Transport};

/// Inbound pipeline stack
///
/// Processes incoming connections:
/// Transport (accept) → Protocol (parse)
pub struct InboundStack {
    pub tag: String,
    pub listen: Address,
    pub transport: Arc<dyn Transport>,
    pub protocol: Arc<dyn ProxyProtocol>,
    /// Bound on the protocol handshake
    pub handshake_timeout: Duration,
}

impl InboundStack {
    pub fn new(
        tag: impl Into<String>,
        listen: Address,
        transport: Arc<dyn Transport>,
        protocol: Arc<dyn ProxyProtocol>,
    ) -> Self {
        Self {
            tag: tag.into(),
            listen,
            transport,
            protocol,
            handshake_timeout: Duration::from_secs(4),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Parse an accepted stream into metadata tagged with this inbound
    pub async fn process(&self, stream: Stream) -> Result<(Metadata, Stream)> {
        trace!("[{}] Parsing protocol ({})", self.tag, self.protocol.name());

        let (metadata, stream) =
            tokio::time::timeout(self.handshake_timeout, self.protocol.inbound(stream))
                .await
                .map_err(|_| Error::Timeout)??;

        Ok((metadata.with_inbound_tag(&self.tag), stream))
    }
}

/// Outbound pipeline stack
///
/// Processes outgoing connections:
/// Transport (connect) → StreamLayer (client-side) → Protocol (outbound)
pub struct OutboundStack {
    pub tag: String,
    /// Remote server address (for proxy protocols)
    pub server: Option<Address>,
    pub transport: Arc<dyn Transport>,
    pub layer: Option<Arc<dyn StreamLayer>>,
    pub protocol: Arc<dyn ProxyProtocol>,
    /// Resolver for domain targets; without one the transport resolves
    pub dns: Option<Arc<DnsClient>>,
    /// Whether UDP destinations may be routed here
    pub udp: bool,
}

impl OutboundStack {
    pub fn new(
        tag: impl Into<String>,
        transport: Arc<dyn Transport>,
        protocol: Arc<dyn ProxyProtocol>,
    ) -> Self {
        Self {
            tag: tag.into(),
            server: None,
            transport,
            layer: None,
            protocol,
            dns: None,
            udp: false,
        }
    }

    pub fn with_server(mut self, server: Address) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_layer(mut self, layer: Arc<dyn StreamLayer>) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_dns(mut self, dns: Arc<DnsClient>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_udp(mut self) -> Self {
        self.udp = true;
        self
    }

    /// Connect to the target and return a ready stream
    pub async fn connect(&self, metadata: &Metadata) -> Result<Stream> {
        if metadata.network == Network::Udp && !self.udp {
            return Err(Error::Unsupported(format!(
                "[{}] outbound does not relay udp",
                self.tag
            )));
        }

        // Determine connection target
        let target = self.server.as_ref().unwrap_or(&metadata.destination);

        debug!(
            "[{}] Connecting to {} (protocol: {})",
            self.tag,
            target,
            self.protocol.name()
        );

        let mut stream = self.connect_target(target).await?;
        trace!("[{}] Transport connected to {}", self.tag, target);

        if let Some(layer) = &self.layer {
            stream = layer.wrap_client(stream).await?;
        }

        self.protocol.outbound(stream, metadata).await
    }

    /// Resolve domains through the DNS client and try each address in turn
    async fn connect_target(&self, target: &Address) -> Result<Stream> {
        let (dns, domain, port) = match (&self.dns, target) {
            (Some(dns), Address::Domain(domain, port)) => (dns, domain, *port),
            _ => return self.transport.connect(target).await,
        };

        let mut last_error = None;
        for ip in dns.lookup(domain).await? {
            let addr = Address::Socket((ip, port).into());
            match self.transport.connect(&addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("[{}] Connect to {} failed: {}", self.tag, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Transport(format!("no address for {}", domain))))
    }
}
