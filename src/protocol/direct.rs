//! Direct protocol
//!
//! The connected stream already reaches the target; nothing to negotiate.

use async_trait::async_trait;

use crate::common::{Metadata, Result, Stream};
use crate::error::Error;

use super::ProxyProtocol;

/// Outbound-only passthrough for freedom and blackhole outbounds
pub struct DirectProtocol;

#[async_trait]
impl ProxyProtocol for DirectProtocol {
    async fn inbound(&self, _stream: Stream) -> Result<(Metadata, Stream)> {
        Err(Error::Unsupported("direct cannot be used as inbound".into()))
    }

    async fn outbound(&self, stream: Stream, _metadata: &Metadata) -> Result<Stream> {
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
