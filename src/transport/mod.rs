//! Transport layer: the common currency between every transform
//!
//! Provides:
//! - [`StreamConn`]: a bidirectional byte stream with independent half-close
//! - [`StreamDialer`]: the single capability every transform implements
//! - [`TcpDialer`]: the innermost dialer of every chain
//! - [`LoggingDialer`]: byte-counting diagnostic wrapper

mod connection;
mod logging;
mod tcp;

pub use connection::{CloseState, ConnectionState};
pub use logging::{ByteCounters, LoggingConn, LoggingDialer};
pub use tcp::{TcpConn, TcpDialer};

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{layer} protocol violation: {reason}")]
    Protocol { layer: &'static str, reason: String },

    #[error("{layer} handshake rejected: {reason}")]
    Handshake { layer: &'static str, reason: String },

    #[error("Proxyless conditions not met for {0}")]
    ConditionsNotMet(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    /// Protocol violation attributed to a layer
    pub fn protocol(layer: &'static str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            layer,
            reason: reason.into(),
        }
    }

    /// Rejected handshake attributed to a layer
    pub fn handshake(layer: &'static str, reason: impl Into<String>) -> Self {
        Self::Handshake {
            layer,
            reason: reason.into(),
        }
    }
}

/// How a connection honours `close_read` / `close_write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfCloseMode {
    /// Each direction can be closed on its own
    Independent,
    /// Either half-close tears down the whole stream
    FullClose,
}

/// A bidirectional byte stream with independent half-close.
///
/// `close_write` is the `AsyncWrite::poll_shutdown` path: it flushes and
/// signals EOF to the peer. `close_read` stops the read direction. Both
/// are idempotent, and `close` after either half-close never fails because
/// of the earlier one.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Half-close behaviour, fixed when the connection is built
    fn half_close_mode(&self) -> HalfCloseMode;

    /// Stop reading. Writes keep working on `Independent` connections.
    fn close_read(&mut self) -> io::Result<()>;
}

/// Boxed connection handed between layers
pub type BoxConn = Box<dyn StreamConn>;

impl<T: StreamConn + ?Sized> StreamConn for Box<T> {
    fn half_close_mode(&self) -> HalfCloseMode {
        (**self).half_close_mode()
    }

    fn close_read(&mut self) -> io::Result<()> {
        (**self).close_read()
    }
}

/// Async helpers shared by every [`StreamConn`]
#[async_trait]
pub trait StreamConnExt: StreamConn {
    /// Flush and signal EOF to the peer
    async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Close both directions
    async fn close(&mut self) -> io::Result<()> {
        let write = self.shutdown().await;
        let read = self.close_read();
        write.and(read)
    }
}

impl<T: StreamConn + ?Sized> StreamConnExt for T {}

/// Connection-opening capability implemented by every transform
#[async_trait]
pub trait StreamDialer: Send + Sync {
    /// Open a stream towards `addr` (`host:port`).
    ///
    /// Dropping the returned future cancels the dial.
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether this dialer rewrites HTTP request lines or headers
    fn rewrites_http(&self) -> bool {
        false
    }
}

/// Shared handle to a dialer
pub type SharedDialer = Arc<dyn StreamDialer>;

#[async_trait]
impl<D: StreamDialer + ?Sized> StreamDialer for Arc<D> {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        (**self).dial_stream(addr).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn rewrites_http(&self) -> bool {
        (**self).rewrites_http()
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Enable TCP_NODELAY
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals
pub fn split_host_port(addr: &str) -> Result<(&str, u16), TransportError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(TransportError::InvalidAddress(addr.to_string()));
    }

    Ok((host, port))
}

/// Join a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Pass-through wrapper that gives any plain async stream a [`StreamConn`]
/// face with `Independent` semantics on the write side only.
///
/// Used for in-memory pipes in tests and for streams whose read side has
/// no OS-level shutdown.
pub struct PlainConn<S> {
    inner: S,
    state: CloseState,
}

impl<S> PlainConn<S> {
    /// Wrap a stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: CloseState::new(),
        }
    }

    /// Get the inner stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PlainConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.state.is_read_closed() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PlainConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.state.is_write_closed() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.state.is_write_closed() {
            return Poll::Ready(Ok(()));
        }
        ready!(Pin::new(&mut self.inner).poll_shutdown(cx))?;
        self.state.close_write();
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for PlainConn<S> {
    fn half_close_mode(&self) -> HalfCloseMode {
        HalfCloseMode::Independent
    }

    fn close_read(&mut self) -> io::Result<()> {
        self.state.close_read();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com", 443));
        assert_eq!(split_host_port("[::1]:8080").unwrap(), ("::1", 8080));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("host:http").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
        assert_eq!(join_host_port("::1", 443), "[::1]:443");
    }

    #[tokio::test]
    async fn test_plain_conn_half_close() {
        use tokio::io::AsyncReadExt;

        let (a, b) = tokio::io::duplex(64);
        let mut a = PlainConn::new(a);
        let mut b = PlainConn::new(b);

        a.close_read().unwrap();
        a.write_all(b"still writing").await.unwrap();
        a.close_write().await.unwrap();

        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"still writing");

        // Idempotent full close after both halves
        a.close().await.unwrap();
    }
}
