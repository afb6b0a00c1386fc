//! HTTP proxy protocol implementation
//!
//! CONNECT requests become raw tunnels. Absolute-form requests (`GET http://...`)
//! are rewritten to origin-form and replayed to the target.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::common::{Address, Metadata, PrefixedStream, Result, Stream};
use crate::error::Error;

use super::{HttpConfig, ProxyProtocol};

/// Upper bound on a request or response head
const MAX_HEAD_LINES: usize = 128;

/// HTTP proxy protocol handler
pub struct HttpProtocol {
    config: HttpConfig,
}

impl HttpProtocol {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    fn requires_auth(&self) -> bool {
        !self.config.accounts.is_empty()
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
            return false;
        };
        self.config.accounts.iter().any(|a| {
            BASE64.encode(format!("{}:{}", a.user, a.pass)) == encoded.trim()
        })
    }
}

/// Read one CRLF-terminated line, failing on premature EOF
async fn read_line(reader: &mut BufReader<Stream>) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::Protocol("Unexpected EOF in HTTP head".into()));
    }
    Ok(line)
}

/// Drain the reader and keep any bytes it already buffered past the head
fn into_stream(reader: BufReader<Stream>, head: Option<BytesMut>) -> Stream {
    let leftover = reader.buffer().to_vec();
    let inner = reader.into_inner();

    let mut prefix = head.unwrap_or_default();
    prefix.put_slice(&leftover);

    if prefix.is_empty() {
        inner
    } else {
        Box::new(PrefixedStream::new(prefix.freeze(), inner))
    }
}

#[async_trait]
impl ProxyProtocol for HttpProtocol {
    async fn inbound(&self, stream: Stream) -> Result<(Metadata, Stream)> {
        let mut reader = BufReader::new(stream);

        // Read request line
        let request_line = read_line(&mut reader).await?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(Error::Protocol("Invalid HTTP request line".into()));
        }

        let method = parts[0];
        let target = parts[1];
        let version = parts[2];

        // Parse headers
        let mut headers = Vec::new();
        let mut auth_header = None;
        let mut complete = false;

        for _ in 0..MAX_HEAD_LINES {
            let line = read_line(&mut reader).await?;
            let line = line.trim();

            if line.is_empty() {
                complete = true;
                break;
            }

            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().to_string();
                if key.trim().eq_ignore_ascii_case("proxy-authorization") {
                    auth_header = Some(value);
                } else if !key.trim().eq_ignore_ascii_case("proxy-connection") {
                    headers.push((key.trim().to_string(), value));
                }
            }
        }

        if !complete {
            return Err(Error::Protocol("HTTP request head too long".into()));
        }

        // Check authentication
        if self.requires_auth() && !self.authorized(auth_header.as_deref()) {
            let mut stream = reader.into_inner();
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\
                      \r\n",
                )
                .await?;
            return Err(Error::Protocol("Authentication required".into()));
        }

        if method.eq_ignore_ascii_case("CONNECT") {
            let address = parse_host_port(target, 443)?;
            let mut stream = into_stream(reader, None);
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            stream.flush().await?;

            let metadata = Metadata::new(address).with_protocol("http");
            return Ok((metadata, stream));
        }

        // GET http://host:port/path
        let url = target
            .strip_prefix("http://")
            .ok_or_else(|| Error::Protocol(format!("Invalid target: {}", target)))?;
        let (authority, path) = match url.find('/') {
            Some(i) => (&url[..i], &url[i..]),
            None => (url, "/"),
        };
        let address = parse_host_port(authority, 80)?;

        let mut head = BytesMut::new();
        head.put_slice(format!("{} {} {}\r\n", method, path, version).as_bytes());
        for (key, value) in &headers {
            head.put_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        head.put_slice(b"\r\n");

        let metadata = Metadata::new(address).with_protocol("http");
        Ok((metadata, into_stream(reader, Some(head))))
    }

    async fn outbound(&self, mut stream: Stream, metadata: &Metadata) -> Result<Stream> {
        let target = match &metadata.destination {
            Address::Socket(addr) => addr.to_string(),
            Address::Domain(domain, port) => format!("{}:{}", domain, port),
        };

        // Build CONNECT request
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

        if let Some(account) = self.config.accounts.first() {
            let encoded = BASE64.encode(format!("{}:{}", account.user, account.pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;

        // Read response
        let mut reader = BufReader::new(stream);
        let response_line = read_line(&mut reader).await?;

        let parts: Vec<&str> = response_line.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(Error::Protocol("Invalid HTTP response".into()));
        }

        let status_code: u16 = parts[1]
            .parse()
            .map_err(|_| Error::Protocol("Invalid status code".into()))?;

        if status_code != 200 {
            return Err(Error::Protocol(format!(
                "HTTP CONNECT failed: {}",
                response_line.trim()
            )));
        }

        // Skip remaining headers
        for _ in 0..MAX_HEAD_LINES {
            if read_line(&mut reader).await?.trim().is_empty() {
                return Ok(into_stream(reader, None));
            }
        }

        Err(Error::Protocol("HTTP response head too long".into()))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Parse an authority into an Address, falling back to `default_port`
fn parse_host_port(s: &str, default_port: u16) -> Result<Address> {
    if let Ok(addr) = s.parse() {
        return Ok(Address::Socket(addr));
    }

    // A bare IPv6 literal in brackets has no port
    if s.starts_with('[') && s.ends_with(']') {
        return Ok(Address::from_host(s, default_port));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::Protocol(format!("Invalid port: {}", p)))?;
            (h, port)
        }
        None => (s, default_port),
    };

    if host.is_empty() {
        return Err(Error::Protocol(format!("Invalid host: {}", s)));
    }

    Ok(Address::from_host(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Account;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com", 80).unwrap(),
            Address::domain("example.com", 80)
        );
        assert_eq!(
            parse_host_port("[::1]:8080", 80).unwrap(),
            Address::Socket("[::1]:8080".parse().unwrap())
        );
        assert!(parse_host_port("example.com:http", 80).is_err());
    }

    #[tokio::test]
    async fn test_connect_keeps_pipelined_bytes() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\nhello")
            .await
            .unwrap();

        let (metadata, mut stream) = HttpProtocol::new(HttpConfig::default())
            .inbound(Box::new(server))
            .await
            .unwrap();
        assert_eq!(metadata.destination, Address::domain("example.com", 443));

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unterminated_head_rejected() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut request = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        for _ in 0..MAX_HEAD_LINES {
            request.extend_from_slice(b"X-Filler: 1\r\n");
        }
        client.write_all(&request).await.unwrap();

        let result = HttpProtocol::new(HttpConfig::default())
            .inbound(Box::new(server))
            .await;
        match result {
            Err(Error::Protocol(message)) => assert!(message.contains("too long"), "{}", message),
            other => panic!("expected head length error, got {:?}", other.map(|(m, _)| m)),
        }
        drop(client);
    }

    #[tokio::test]
    async fn test_plain_request_is_rewritten() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET http://example.com:8080/a?b=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();
        drop(client);

        let (metadata, mut stream) = HttpProtocol::new(HttpConfig::default())
            .inbound(Box::new(server))
            .await
            .unwrap();
        assert_eq!(metadata.destination, Address::domain("example.com", 8080));

        let mut head = String::new();
        stream.read_to_string(&mut head).await.unwrap();
        assert_eq!(head, "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[tokio::test]
    async fn test_outbound_connect_with_auth() {
        let config = HttpConfig {
            accounts: vec![Account {
                user: "u".to_string(),
                pass: "p".to_string(),
            }],
        };
        let (client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn({
            let config = config.clone();
            async move {
                HttpProtocol::new(config)
                    .inbound(Box::new(server))
                    .await
                    .map(|(metadata, _)| metadata)
            }
        });

        let metadata = Metadata::new(Address::domain("example.com", 443));
        HttpProtocol::new(config)
            .outbound(Box::new(client), &metadata)
            .await
            .unwrap();

        let inbound = server_task.await.unwrap().unwrap();
        assert_eq!(inbound.destination, Address::domain("example.com", 443));
    }

    #[tokio::test]
    async fn test_missing_auth_rejected() {
        let config = HttpConfig {
            accounts: vec![Account {
                user: "u".to_string(),
                pass: "p".to_string(),
            }],
        };
        let (client, server) = tokio::io::duplex(4096);

        let server_task =
            tokio::spawn(async move { HttpProtocol::new(config).inbound(Box::new(server)).await.map(|_| ()) });

        let metadata = Metadata::new(Address::domain("example.com", 443));
        let result = HttpProtocol::new(HttpConfig::default())
            .outbound(Box::new(client), &metadata)
            .await;

        assert!(result.is_err());
        assert!(server_task.await.unwrap().is_err());
    }
}
