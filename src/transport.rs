//! Byte-stream transports.
//!
//! The session only needs something it can read from and write to. TLS or
//! any other wrapping is done by a caller-supplied [`Connector`].

use futures::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A duplex byte stream to the broker.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens a fresh transport for each connect attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>>;
}

/// Plain TCP to `host:port`, with Nagle disabled.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            debug!(addr = %self.addr, "tcp connection established");
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}
