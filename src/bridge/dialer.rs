//! Virtual dialer
//!
//! Adapts a `(network, address)` connection hook to an instance's internal
//! dial primitive, so HTTP clients reach the network through the instance
//! instead of the OS socket layer.

use crate::app::Instance;
use crate::common::{Destination, Result, Stream};

/// Dialer bound to one instance for its lifetime
#[derive(Clone, Copy)]
pub struct VirtualDialer<'a> {
    instance: &'a Instance,
}

impl<'a> VirtualDialer<'a> {
    pub fn new(instance: &'a Instance) -> Self {
        Self { instance }
    }

    /// Dial `address` (`host:port`) over `network` (`tcp`, `udp`).
    ///
    /// Parse failures are terminal for this attempt; dial results are
    /// returned unmodified.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Stream> {
        let destination = Destination::parse(&format!("{}:{}", network, address))?;
        self.instance.dial(&destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile;
    use crate::error::Error;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn running() -> Instance {
        let config = compile(br#"{"outbounds": [{"tag": "direct", "protocol": "freedom"}]}"#).unwrap();
        let instance = Instance::build(&config.probe_only()).unwrap();
        instance.start().await.unwrap();
        instance
    }

    #[tokio::test]
    async fn test_dial_through_instance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let instance = running().await;
        let mut stream = VirtualDialer::new(&instance)
            .dial("tcp", &addr.to_string())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        instance.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_parse_failures() {
        let instance = running().await;
        let dialer = VirtualDialer::new(&instance);

        for (network, address) in [("tcp", "no-port"), ("quic", "host:443"), ("tcp", "host:99999")] {
            assert!(
                matches!(dialer.dial(network, address).await, Err(Error::DestinationParse(_))),
                "{}:{}",
                network,
                address
            );
        }

        instance.close().await.unwrap();
    }
}
