//! Latency prober
//!
//! Builds a listener-less scratch instance from a candidate configuration,
//! issues one HTTP GET through it and reports the round trip. The scratch
//! instance never touches the active slot and is closed on every exit path,
//! cancellation included.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::metrics::record_probe;
use crate::app::Instance;
use crate::config::compile;
use crate::error::{Error, Result};
use crate::transport::{StreamLayer, TlsConfig, TlsLayer};

use super::dialer::VirtualDialer;

/// Low-cost endpoint answering 204
pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Timeouts and defaults of a probe
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub tls_handshake_timeout: Duration,
    /// Bounds the whole request: dial, TLS, request and response head
    pub request_timeout: Duration,
    /// Used when the caller passes an empty URL
    pub default_url: String,
    pub user_agent: String,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            tls_handshake_timeout: Duration::from_secs(6),
            request_timeout: Duration::from_secs(12),
            default_url: DEFAULT_PROBE_URL.to_string(),
            user_agent: format!("netium-embed/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Outcome of one probe: elapsed milliseconds, or -1 with an error
#[derive(Debug)]
pub struct ProbeResult {
    pub elapsed_ms: i64,
    pub error: Option<Error>,
}

impl ProbeResult {
    fn success(elapsed: Duration) -> Self {
        Self {
            elapsed_ms: elapsed.as_millis().min(i64::MAX as u128) as i64,
            error: None,
        }
    }

    fn failure(error: Error) -> Self {
        Self {
            elapsed_ms: -1,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<u64> {
        match self.error {
            None => Ok(self.elapsed_ms as u64),
            Some(e) => Err(e),
        }
    }
}

/// Scratch instance accounting
#[derive(Debug, Default)]
pub struct ProbeStats {
    open: AtomicUsize,
    created: AtomicU64,
    /// Went through `Instance::close`
    closed: AtomicU64,
    /// Dropped, closed or not
    released: AtomicU64,
}

impl ProbeStats {
    /// Scratch instances currently alive
    pub fn open_scratch(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

/// Owns a scratch instance. Closing is counted only after `Instance::close`
/// returns; releasing happens in Drop, so a cancelled probe is still released
/// and its remaining tasks aborted.
struct ScratchInstance {
    instance: Instance,
    stats: Arc<ProbeStats>,
}

impl ScratchInstance {
    fn new(instance: Instance, stats: Arc<ProbeStats>) -> Self {
        stats.open.fetch_add(1, Ordering::SeqCst);
        stats.created.fetch_add(1, Ordering::SeqCst);
        Self { instance, stats }
    }

    async fn close(self) {
        if let Err(e) = self.instance.close().await {
            warn!("Failed to close scratch instance: {}", e);
        }
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScratchInstance {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Aborts the HTTP connection driver when the probe is done with it
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Parsed probe URL
struct ProbeTarget {
    https: bool,
    /// Host as it appears in URLs, IPv6 bracketed
    host: String,
    port: u16,
    /// Host header value
    authority: String,
    path: String,
}

impl ProbeTarget {
    fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::ProbeTransport(format!("invalid url '{}': {}", url, e)))?;

        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => {
                return Err(Error::ProbeTransport(format!(
                    "unsupported url scheme in '{}'",
                    url
                )))
            }
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ProbeTransport(format!("missing host in '{}'", url)))?;
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let authority = match uri.port_u16() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let path = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            https,
            host,
            port,
            authority,
            path,
        })
    }

    fn dial_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn server_name(&self) -> String {
        self.host.trim_start_matches('[').trim_end_matches(']').to_string()
    }
}

/// Measures round trip latency through candidate configurations
pub struct LatencyProber {
    options: ProbeOptions,
    stats: Arc<ProbeStats>,
}

impl Default for LatencyProber {
    fn default() -> Self {
        Self::new(ProbeOptions::default())
    }
}

impl LatencyProber {
    pub fn new(options: ProbeOptions) -> Self {
        Self {
            options,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    pub fn stats(&self) -> &Arc<ProbeStats> {
        &self.stats
    }

    /// Probe `url` (or the default URL when empty) through `raw`.
    ///
    /// Failures are returned in the result, never logged to a sink.
    pub async fn measure(&self, raw: &[u8], url: &str) -> ProbeResult {
        let result = self.try_measure(raw, url).await;
        record_probe(result.as_ref().ok().copied());

        match result {
            Ok(elapsed) => ProbeResult::success(elapsed),
            Err(e) => {
                debug!("Probe failed: {}", e);
                ProbeResult::failure(e)
            }
        }
    }

    async fn try_measure(&self, raw: &[u8], url: &str) -> Result<Duration> {
        let config = compile(raw)?.probe_only();
        let url = if url.is_empty() {
            self.options.default_url.as_str()
        } else {
            url
        };
        let target = ProbeTarget::parse(url)?;

        let scratch = ScratchInstance::new(Instance::build(&config)?, self.stats.clone());

        let result = async {
            scratch.instance.start().await?;

            // Startup is excluded from the measurement
            let start = Instant::now();
            tokio::time::timeout(
                self.options.request_timeout,
                self.round_trip(&scratch.instance, &target),
            )
            .await
            .map_err(|_| {
                Error::ProbeTransport(format!(
                    "request timed out after {:?}",
                    self.options.request_timeout
                ))
            })??;
            Ok(start.elapsed())
        }
        .await;

        scratch.close().await;
        result
    }

    /// One GET through the instance; succeeds on 200 or 204
    async fn round_trip(&self, instance: &Instance, target: &ProbeTarget) -> Result<()> {
        self.send(instance, target).await.map_err(|e| match e {
            Error::ProbeTransport(_) | Error::DestinationParse(_) => e,
            other => Error::ProbeTransport(other.to_string()),
        })
    }

    async fn send(&self, instance: &Instance, target: &ProbeTarget) -> Result<()> {
        let mut stream = VirtualDialer::new(instance)
            .dial("tcp", &target.dial_address())
            .await?;

        if target.https {
            let layer = TlsLayer::new(&TlsConfig {
                server_name: Some(target.server_name()),
                alpn: vec!["http/1.1".to_string()],
                ..Default::default()
            })?;
            stream = tokio::time::timeout(self.options.tls_handshake_timeout, layer.wrap_client(stream))
                .await
                .map_err(|_| {
                    Error::ProbeTransport(format!(
                        "TLS handshake timed out after {:?}",
                        self.options.tls_handshake_timeout
                    ))
                })??;
        }

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::ProbeTransport(format!("HTTP handshake failed: {}", e)))?;
        let _driver = AbortOnDrop(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Probe connection ended: {}", e);
            }
        }));

        let request = Request::builder()
            .method(Method::GET)
            .uri(target.path.as_str())
            .header(HOST, target.authority.as_str())
            .header(USER_AGENT, self.options.user_agent.as_str())
            .header(CONNECTION, "close")
            .body(Body::empty())
            .map_err(|e| Error::ProbeTransport(format!("invalid request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::ProbeTransport(format!("request failed: {}", e)))?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::ProbeTransport(format!("unexpected status {}", status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const DIRECT: &[u8] = br#"{"outbounds": [{"tag": "direct", "protocol": "freedom"}]}"#;
    const BLACKHOLE: &[u8] = br#"{"outbounds": [{"tag": "block", "protocol": "blackhole"}]}"#;

    /// Answers every request with `status_line`
    async fn http_server(status_line: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 512];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status_line
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    /// Every scratch instance went through close and was released
    fn assert_all_closed(stats: &ProbeStats) {
        assert_eq!(stats.open_scratch(), 0);
        assert_eq!(stats.closed(), stats.created());
        assert_eq!(stats.released(), stats.created());
    }

    fn fast() -> ProbeOptions {
        ProbeOptions {
            tls_handshake_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_measure_success() {
        let addr = http_server("204 No Content").await;
        let prober = LatencyProber::default();

        let result = prober
            .measure(DIRECT, &format!("http://{}/generate_204", addr))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(result.elapsed_ms >= 0);
        assert!(result.elapsed_ms < 12_000);

        assert_eq!(prober.stats().created(), 1);
        assert_all_closed(prober.stats());
    }

    #[tokio::test]
    async fn test_measure_status_codes() {
        let ok = http_server("200 OK").await;
        let missing = http_server("404 Not Found").await;
        let prober = LatencyProber::new(fast());

        assert!(prober.measure(DIRECT, &format!("http://{}/", ok)).await.is_success());

        let result = prober.measure(DIRECT, &format!("http://{}/", missing)).await;
        assert_eq!(result.elapsed_ms, -1);
        assert!(matches!(result.error, Some(Error::ProbeTransport(_))));
        assert_eq!(prober.stats().created(), 2);
        assert_all_closed(prober.stats());
    }

    #[tokio::test]
    async fn test_measure_blackhole_times_out() {
        let prober = LatencyProber::new(fast());
        let started = Instant::now();

        let result = prober.measure(BLACKHOLE, "http://example.com/").await;
        assert_eq!(result.elapsed_ms, -1);
        assert!(matches!(result.error, Some(Error::ProbeTransport(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_all_closed(prober.stats());
    }

    #[tokio::test]
    async fn test_measure_blackhole_http_response() {
        let raw = br#"{"outbounds": [{
            "tag": "block",
            "protocol": "blackhole",
            "settings": {"response": {"type": "http"}}
        }]}"#;
        let prober = LatencyProber::new(ProbeOptions {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        });

        let result = prober.measure(raw, "http://example.com/").await;
        let error = result.error.expect("403 is not a success");
        assert!(error.to_string().contains("403"), "{}", error);
    }

    #[tokio::test]
    async fn test_measure_tls_handshake_timeout() {
        let prober = LatencyProber::new(ProbeOptions {
            tls_handshake_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        });

        let result = prober.measure(BLACKHOLE, "").await;
        let error = result.error.expect("probe through blackhole must fail");
        assert!(error.to_string().contains("TLS handshake"), "{}", error);
    }

    #[tokio::test]
    async fn test_measure_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = LatencyProber::new(fast());
        let result = prober.measure(DIRECT, &format!("http://{}/", addr)).await;
        assert!(!result.is_success());
        assert_eq!(prober.stats().created(), 1);
        assert_all_closed(prober.stats());
    }

    #[tokio::test]
    async fn test_measure_config_errors() {
        let prober = LatencyProber::new(fast());

        let result = prober.measure(b"{broken", "").await;
        assert!(matches!(result.error, Some(Error::Decode(_))));

        let result = prober
            .measure(br#"{"outbounds": [{"protocol": "vmess"}]}"#, "")
            .await;
        assert!(matches!(result.error, Some(Error::Build(_))));

        let result = prober.measure(DIRECT, "ftp://example.com/").await;
        assert!(matches!(result.error, Some(Error::ProbeTransport(_))));

        assert_eq!(prober.stats().created(), 0);
    }

    #[tokio::test]
    async fn test_measure_ignores_inbounds() {
        // The listen port is taken; a probe must not try to bind it
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = http_server("204 No Content").await;
        let raw = format!(
            r#"{{
                "inbounds": [{{"listen": "127.0.0.1", "port": {}, "protocol": "socks"}}],
                "outbounds": [{{"tag": "direct", "protocol": "freedom"}}],
                "stats": {{}},
                "policy": {{}}
            }}"#,
            taken.local_addr().unwrap().port()
        );

        let prober = LatencyProber::new(fast());
        let result = prober
            .measure(raw.as_bytes(), &format!("http://{}/generate_204", server))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
    }

    #[tokio::test]
    async fn test_cancelled_measure_releases_scratch() {
        let prober = LatencyProber::new(ProbeOptions {
            request_timeout: Duration::from_secs(30),
            ..Default::default()
        });

        let cancelled = tokio::time::timeout(
            Duration::from_millis(200),
            prober.measure(BLACKHOLE, "http://example.com/"),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(prober.stats().created(), 1);
        assert_eq!(prober.stats().open_scratch(), 0);
        assert_eq!(prober.stats().released(), 1);
        assert_eq!(prober.stats().closed(), 0);
    }

    #[tokio::test]
    async fn test_dropped_scratch_is_not_closed() {
        let config = compile(DIRECT).unwrap().probe_only();
        let stats = Arc::new(ProbeStats::default());

        let scratch = ScratchInstance::new(Instance::build(&config).unwrap(), stats.clone());
        scratch.instance.start().await.unwrap();
        drop(scratch);

        assert_eq!(stats.created(), 1);
        assert_eq!(stats.released(), 1);
        assert_eq!(stats.closed(), 0);
        assert_eq!(stats.open_scratch(), 0);
    }

    #[test]
    fn test_target_parse() {
        let target = ProbeTarget::parse("https://www.google.com/generate_204").unwrap();
        assert!(target.https);
        assert_eq!(target.dial_address(), "www.google.com:443");
        assert_eq!(target.authority, "www.google.com");
        assert_eq!(target.path, "/generate_204");

        let target = ProbeTarget::parse("http://[::1]:8080").unwrap();
        assert_eq!(target.dial_address(), "[::1]:8080");
        assert_eq!(target.server_name(), "::1");
        assert_eq!(target.path, "/");
    }
}
