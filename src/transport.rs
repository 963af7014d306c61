//! The byte transport (spec §1/§6's "byte transport (external)" row).
//! `Transport` is a blanket trait over any `AsyncRead + AsyncWrite`
//! stream; `Connector` is how the controller obtains a fresh one on each
//! (re)connect attempt, since a single stream cannot be "reopened" once
//! its socket has closed.
//!
//! Grounded on the teacher's `get_client`/`get_multiplexed_connection`
//! pair in `reconnecting_connection.rs`, which is exactly this shape: a
//! stored descriptor (`redis::Client`) that knows how to produce a new
//! live connection on demand.

use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Any full-duplex byte stream the controller can drive. TCP/Unix
/// sockets implement it automatically; TLS or a test double need only
/// provide the same two marker bounds.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Produces a fresh [`BoxedTransport`] for each connect/reconnect
/// attempt. Implemented manually (rather than via `#[async_trait]`, which
/// this crate has no other use for) so the method returns a boxed future
/// directly.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<BoxedTransport>> + Send + '_>>;
}

/// Connects to a `host:port` TCP address.
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
}

impl Connector for TcpConnector {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<BoxedTransport>> + Send + '_>> {
        Box::pin(async move {
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

/// Connects to a Unix domain socket, for deployments that front Redis
/// with a local socket instead of TCP.
pub struct UnixConnector {
    pub path: std::path::PathBuf,
}

impl Connector for UnixConnector {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<BoxedTransport>> + Send + '_>> {
        Box::pin(async move {
            let stream = UnixStream::connect(&self.path).await?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}
