//! Instance - a runnable proxy core built from a [`CoreConfig`]
//!
//! Lifecycle: Constructed → (start) → Running → (close) → Closed.
//! Construction wires outbounds, router, DNS and dispatcher without any IO.
//! `start` binds every inbound before spawning accept loops, so a bind
//! failure leaves nothing running.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::common::{Address, Destination, Metadata, Result, Stream};
use crate::config::{
    env_snapshot, AppKind, CoreConfig, InboundProtocolConfig, OutboundHandlerConfig,
    OutboundProtocolConfig,
};
use crate::dns::DnsClient;
use crate::error::Error;
use crate::protocol::{DirectProtocol, HttpProtocol, ProxyProtocol, Socks5Protocol};
use crate::router::{Router, RuleRouter, DefaultRouter};
use crate::transport::{BlackholeTransport, Listener, TcpTransport, TlsLayer, Transport};

use super::dispatcher::Dispatcher;
use super::metrics::INSTANCES_RUNNING;
use super::stack::{InboundStack, OutboundStack};
use super::stats::StatsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Constructed,
    Running,
    Closed,
}

pub struct Instance {
    inbounds: Vec<Arc<InboundStack>>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<InstanceState>,
    /// Serializes start and close
    lifecycle: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<Vec<(String, SocketAddr)>>,
}

impl Instance {
    /// Wire a constructed instance. Performs no IO.
    pub fn build(config: &CoreConfig) -> Result<Self> {
        for kind in [AppKind::Dispatcher, AppKind::InboundManager, AppKind::OutboundManager] {
            if !config.has_app(kind) {
                return Err(Error::Build(format!("missing {:?} section", kind)));
            }
        }

        if let Some(fakedns) = config.fake_dns() {
            warn!(
                "Fake DNS ({} pools) is configured but not served by this core",
                fakedns.pools.len()
            );
        }

        let env = env_snapshot();
        let policy = config.policy().copied().unwrap_or_default();
        let dns = Arc::new(DnsClient::new(config.dns().cloned().unwrap_or_default()));

        // Build outbounds; the first one is the default route.
        // Untagged outbounds past the first are unreachable.
        let mut outbounds = HashMap::new();
        for outbound in &config.outbounds {
            if outbounds.contains_key(&outbound.tag) {
                if outbound.tag.is_empty() {
                    continue;
                }
                return Err(Error::Build(format!("duplicate outbound tag: {}", outbound.tag)));
            }
            let stack = build_outbound(outbound, &dns)?;
            outbounds.insert(outbound.tag.clone(), Arc::new(stack));
        }
        let default_outbound = config
            .outbounds
            .first()
            .map(|o| o.tag.clone())
            .unwrap_or_default();

        let rules = config.router().map(|r| r.rules.clone()).unwrap_or_default();
        if let Some(rule) = rules.iter().find(|r| !outbounds.contains_key(&r.outbound_tag)) {
            return Err(Error::Build(format!(
                "routing rule references unknown outbound: {}",
                rule.outbound_tag
            )));
        }
        let router: Arc<dyn Router> = if rules.is_empty() {
            Arc::new(DefaultRouter::new(default_outbound))
        } else {
            Arc::new(RuleRouter::new(rules, default_outbound))
        };

        let access_log = config.log().map(|l| l.access).unwrap_or(false);
        let mut dispatcher = Dispatcher::new(router, outbounds)
            .with_conn_idle(policy.conn_idle)
            .with_relay_buffer(env.relay_buffer_bytes())
            .with_access_log(access_log);

        if config.has_app(AppKind::Stats) {
            dispatcher = dispatcher.with_stats(Arc::new(StatsCollector::new(
                config.inbounds.iter().map(|i| i.tag.as_str()),
                config.outbounds.iter().map(|o| o.tag.as_str()),
            )));
        }

        let mut seen = HashSet::new();
        let mut inbounds = Vec::new();
        for inbound in &config.inbounds {
            if !inbound.tag.is_empty() && !seen.insert(inbound.tag.as_str()) {
                return Err(Error::Build(format!("duplicate inbound tag: {}", inbound.tag)));
            }
            let protocol: Arc<dyn ProxyProtocol> = match &inbound.protocol {
                InboundProtocolConfig::Socks(c) => Arc::new(Socks5Protocol::new(c.clone())),
                InboundProtocolConfig::Http(c) => Arc::new(HttpProtocol::new(c.clone())),
            };
            let stack = InboundStack::new(
                &inbound.tag,
                Address::Socket(inbound.listen),
                Arc::new(TcpTransport::new()),
                protocol,
            )
            .with_handshake_timeout(policy.handshake);
            inbounds.push(Arc::new(stack));
        }

        debug!(
            "Instance built: {} inbounds, {} outbounds",
            inbounds.len(),
            config.outbounds.len()
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inbounds,
            dispatcher: Arc::new(dispatcher),
            state: Mutex::new(InstanceState::Constructed),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == InstanceState::Running
    }

    /// Bound inbound addresses, available once running
    pub fn inbound_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.bound.lock().clone()
    }

    /// Whether a fixed-port inbound of `self` would collide with an address
    /// `other` currently holds. Port 0 never collides.
    pub fn shares_listen_addr(&self, other: &Instance) -> bool {
        let held = other.bound.lock();
        self.inbounds.iter().any(|inbound| match &inbound.listen {
            Address::Socket(want) if want.port() != 0 => held.iter().any(|(_, have)| {
                have.port() == want.port()
                    && (have.ip() == want.ip()
                        || have.ip().is_unspecified()
                        || want.ip().is_unspecified())
            }),
            _ => false,
        })
    }

    /// Bind all inbounds and start serving. Starting a running instance is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        match self.state() {
            InstanceState::Running => return Ok(()),
            InstanceState::Closed => return Err(Error::Start("instance is closed".into())),
            InstanceState::Constructed => {}
        }

        let mut listeners = Vec::with_capacity(self.inbounds.len());
        for inbound in &self.inbounds {
            let listener = inbound.transport.bind(&inbound.listen).await.map_err(|e| {
                Error::Start(format!(
                    "[{}] failed to listen on {}: {}",
                    inbound.tag, inbound.listen, e
                ))
            })?;
            listeners.push((inbound.clone(), listener));
        }

        let mut tasks = self.tasks.lock();
        let mut bound = self.bound.lock();
        for (inbound, listener) in listeners {
            if let Ok(Address::Socket(addr)) = listener.local_addr() {
                info!(
                    "[{}] Listening on {} (protocol: {})",
                    inbound.tag,
                    addr,
                    inbound.protocol.name()
                );
                bound.push((inbound.tag.clone(), addr));
            }

            let dispatcher = self.dispatcher.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(run_inbound(inbound, listener, dispatcher, shutdown_rx)));
        }

        *self.state.lock() = InstanceState::Running;
        INSTANCES_RUNNING.inc();
        info!("Instance started with {} inbounds", self.inbounds.len());

        Ok(())
    }

    /// Stop serving and wait for every task. Idempotent; closing a
    /// constructed instance just marks it closed.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let previous = std::mem::replace(&mut *self.state.lock(), InstanceState::Closed);
        if previous == InstanceState::Running {
            INSTANCES_RUNNING.dec();
        }

        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        self.bound.lock().clear();

        let mut failures = Vec::new();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    failures.push(e.to_string());
                }
            }
        }

        if previous == InstanceState::Running {
            info!("Instance closed");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ResourceCleanup(failures.join("; ")))
        }
    }

    /// Connect through the routing and outbound machinery of this instance
    pub async fn dial(&self, destination: &Destination) -> Result<Stream> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }

        let metadata = Metadata::from(destination);
        let (stream, tag) = self.dispatcher.dial(&metadata).await?;
        debug!("Dialed {} via [{}]", destination, tag);
        Ok(stream)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if *self.state.get_mut() == InstanceState::Running {
            INSTANCES_RUNNING.dec();
        }
    }
}

fn build_outbound(config: &OutboundHandlerConfig, dns: &Arc<DnsClient>) -> Result<OutboundStack> {
    let tcp: Arc<dyn Transport> = Arc::new(TcpTransport::new());

    let mut stack = match &config.protocol {
        OutboundProtocolConfig::Freedom => {
            OutboundStack::new(&config.tag, tcp, Arc::new(DirectProtocol)).with_dns(dns.clone())
        }
        OutboundProtocolConfig::Blackhole { response } => OutboundStack::new(
            &config.tag,
            Arc::new(BlackholeTransport::new().with_response(*response)),
            Arc::new(DirectProtocol),
        )
        .with_udp(),
        OutboundProtocolConfig::Socks { server, config: socks } => {
            OutboundStack::new(&config.tag, tcp, Arc::new(Socks5Protocol::new(socks.clone())))
                .with_server(server.clone())
                .with_dns(dns.clone())
        }
        OutboundProtocolConfig::Http { server, config: http } => {
            OutboundStack::new(&config.tag, tcp, Arc::new(HttpProtocol::new(http.clone())))
                .with_server(server.clone())
                .with_dns(dns.clone())
        }
    };

    if let Some(tls) = &config.tls {
        stack = stack.with_layer(Arc::new(TlsLayer::new(tls)?));
    }

    debug!(
        "Built outbound [{}] ({}{})",
        config.tag,
        config.protocol.name(),
        if config.tls.is_some() { "+tls" } else { "" }
    );

    Ok(stack)
}

/// Accept loop for one inbound; connection tasks are aborted on shutdown
async fn run_inbound(
    inbound: Arc<InboundStack>,
    listener: Box<dyn Listener>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let inbound_stats = dispatcher.collector().and_then(|c| c.inbound(&inbound.tag));
    let mut connections = JoinSet::new();
    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        conn_count += 1;
                        let conn_id = conn_count;
                        debug!("[{}] New connection #{} from {}", inbound.tag, conn_id, source);

                        let inbound = inbound.clone();
                        let dispatcher = dispatcher.clone();
                        let stats = inbound_stats.clone();
                        if let Some(stats) = &stats {
                            stats.connection_accepted();
                        }

                        connections.spawn(async move {
                            if let Err(e) = handle_connection(&inbound, &dispatcher, stream, source.clone()).await {
                                debug!("[{}] Connection #{} from {} error: {}", inbound.tag, conn_id, source, e);
                            }
                            if let Some(stats) = stats {
                                stats.connection_closed();
                            }
                        });
                    }
                    Err(e) => {
                        error!("[{}] Accept error: {}", inbound.tag, e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!("[{}] Shutting down (handled {} connections)", inbound.tag, conn_count);
                break;
            }
        }
    }

    connections.shutdown().await;
}

/// Handle a single connection
async fn handle_connection(
    inbound: &InboundStack,
    dispatcher: &Dispatcher,
    stream: Stream,
    source: Address,
) -> Result<()> {
    let (metadata, stream) = inbound.process(stream).await?;
    dispatcher.dispatch(metadata.with_source(source), stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{compile, PolicySettings};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn build(raw: &str) -> Instance {
        Instance::build(&compile(raw.as_bytes()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let instance = build(r#"{"outbounds": [{"tag": "direct", "protocol": "freedom"}]}"#);
        assert_eq!(instance.state(), InstanceState::Constructed);

        let dest = Destination::parse("tcp:127.0.0.1:9").unwrap();
        assert!(matches!(instance.dial(&dest).await, Err(Error::NotRunning)));

        instance.start().await.unwrap();
        instance.start().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Running);

        instance.close().await.unwrap();
        instance.close().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Closed);
        assert!(matches!(instance.dial(&dest).await, Err(Error::NotRunning)));
        assert!(matches!(instance.start().await, Err(Error::Start(_))));
    }

    #[tokio::test]
    async fn test_close_constructed() {
        let instance = build(r#"{"outbounds": [{"protocol": "freedom"}]}"#);
        instance.close().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Closed);
    }

    #[tokio::test]
    async fn test_dial_routes_by_rule() {
        let echo = echo_server().await;
        let instance = build(&format!(
            r#"{{
                "outbounds": [
                    {{"tag": "direct", "protocol": "freedom"}},
                    {{"tag": "block", "protocol": "blackhole"}}
                ],
                "routing": {{"rules": [{{"type": "field", "port": "{}", "outboundTag": "direct"}}]}}
            }}"#,
            echo.port()
        ));
        instance.start().await.unwrap();

        // Matches the rule: reaches the echo server
        let mut stream = instance
            .dial(&Destination::tcp(Address::Socket(echo)))
            .await
            .unwrap();
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // Everything else falls through to the first outbound
        let dest = Destination::parse("tcp:127.0.0.1:1").unwrap();
        assert!(instance.dial(&dest).await.is_err());

        instance.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_socks_inbound_end_to_end() {
        let echo = echo_server().await;
        let instance = build(
            r#"{
                "inbounds": [{"tag": "socks-in", "listen": "127.0.0.1", "port": 0, "protocol": "socks"}],
                "outbounds": [{"tag": "direct", "protocol": "freedom"}],
                "stats": {}
            }"#,
        );
        instance.start().await.unwrap();
        let socks_addr = instance.inbound_addrs()[0].1;

        let mut client = TcpStream::connect(socks_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let ip = match echo.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            std::net::IpAddr::V6(_) => unreachable!(),
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"through socks").await.unwrap();
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through socks");

        instance.close().await.unwrap();
        assert!(instance.inbound_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_on_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let instance = build(&format!(
            r#"{{
                "inbounds": [{{"tag": "in", "listen": "127.0.0.1", "port": {}, "protocol": "http"}}],
                "outbounds": [{{"protocol": "freedom"}}]
            }}"#,
            port
        ));

        assert!(matches!(instance.start().await, Err(Error::Start(_))));
        assert_eq!(instance.state(), InstanceState::Constructed);
        instance.close().await.unwrap();
    }

    #[test]
    fn test_build_requires_core_sections() {
        let mut config = compile(br#"{"outbounds": [{"protocol": "freedom"}]}"#).unwrap();
        config.apps.retain(|app| app.kind() != AppKind::OutboundManager);
        assert!(matches!(Instance::build(&config), Err(Error::Build(_))));
    }

    #[test]
    fn test_policy_reaches_inbounds() {
        let instance = build(
            r#"{
                "inbounds": [{"tag": "in", "port": 0, "protocol": "http"}],
                "outbounds": [{"protocol": "freedom"}],
                "policy": {"levels": {"0": {"handshake": 9}}}
            }"#,
        );
        assert_eq!(instance.inbounds[0].handshake_timeout, std::time::Duration::from_secs(9));
        assert_eq!(PolicySettings::default().handshake, std::time::Duration::from_secs(4));
    }
}
