//! Blackhole transport
//!
//! Connections always succeed and go nowhere. Writes are swallowed. Reads
//! either stall until the hold time runs out, or yield a canned HTTP 403
//! followed by EOF when an HTTP response is configured.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::{Listener, Transport};

/// Hold time before a silent blackhole connection reports EOF
const DEFAULT_HOLD: Duration = Duration::from_secs(300);

const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
Connection: close\r\n\
Cache-Control: max-age=3600, public\r\n\
Content-Length: 0\r\n\r\n";

/// What a blackholed connection answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlackholeResponse {
    /// Nothing; the connection stalls
    #[default]
    None,
    /// A 403 response, then EOF
    Http,
}

impl BlackholeResponse {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(BlackholeResponse::None),
            "http" => Some(BlackholeResponse::Http),
            _ => None,
        }
    }
}

pub struct BlackholeTransport {
    response: BlackholeResponse,
    hold: Duration,
}

impl BlackholeTransport {
    pub fn new() -> Self {
        Self {
            response: BlackholeResponse::None,
            hold: DEFAULT_HOLD,
        }
    }

    pub fn with_response(mut self, response: BlackholeResponse) -> Self {
        self.response = response;
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

impl Default for BlackholeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for BlackholeTransport {
    async fn connect(&self, _addr: &Address) -> Result<Stream> {
        let stream = match self.response {
            BlackholeResponse::None => BlackholeStream::silent(self.hold),
            BlackholeResponse::Http => BlackholeStream::answering(HTTP_RESPONSE),
        };
        Ok(Box::new(stream))
    }

    async fn bind(&self, _addr: &Address) -> Result<Box<dyn Listener>> {
        Err(Error::Unsupported("blackhole transport cannot bind".into()))
    }
}

struct BlackholeStream {
    /// Canned bytes still to be read, released once the peer has written
    pending: &'static [u8],
    written: bool,
    /// Reader parked until the first write
    read_waker: Option<Waker>,
    /// `None` once reads have reached EOF
    hold: Option<Pin<Box<Sleep>>>,
}

impl BlackholeStream {
    fn silent(hold: Duration) -> Self {
        Self {
            pending: &[],
            written: false,
            read_waker: None,
            hold: Some(Box::pin(tokio::time::sleep(hold))),
        }
    }

    fn answering(response: &'static [u8]) -> Self {
        Self {
            pending: response,
            written: false,
            read_waker: None,
            hold: None,
        }
    }
}

impl AsyncRead for BlackholeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            if !self.written {
                self.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..n]);
            self.pending = &self.pending[n..];
            return Poll::Ready(Ok(()));
        }

        match self.hold.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(hold) => match hold.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.hold = None;
                    Poll::Ready(Ok(()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for BlackholeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !buf.is_empty() && !self.written {
            self.written = true;
            if let Some(waker) = self.read_waker.take() {
                waker.wake();
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
