//! Diagnostic byte-counting layer
//!
//! Counts and traces traffic without touching it. Removing this layer from a
//! chain changes nothing on the wire.

use super::{BoxConn, HalfCloseMode, SharedDialer, StreamConn, StreamDialer, TransportError};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// Shared read/write byte counters
#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl ByteCounters {
    /// Total bytes read
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Total bytes written
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Dialer that wraps every connection in a [`LoggingConn`]
pub struct LoggingDialer {
    inner: SharedDialer,
    totals: ByteCounters,
}

impl LoggingDialer {
    /// Wrap an inner dialer
    pub fn new(inner: SharedDialer) -> Self {
        Self {
            inner,
            totals: ByteCounters::default(),
        }
    }

    /// Counters aggregated over every connection this dialer produced
    pub fn totals(&self) -> ByteCounters {
        self.totals.clone()
    }
}

#[async_trait]
impl StreamDialer for LoggingDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        match self.inner.dial_stream(addr).await {
            Ok(conn) => {
                debug!("[{}] dialed {}", self.inner.name(), addr);
                Ok(Box::new(LoggingConn::with_counters(
                    conn,
                    addr,
                    self.totals.clone(),
                )))
            }
            Err(e) => {
                debug!("[{}] dial {} failed: {}", self.inner.name(), addr, e);
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "logging"
    }

    fn rewrites_http(&self) -> bool {
        self.inner.rewrites_http()
    }
}

/// Connection wrapper that counts bytes in each direction
pub struct LoggingConn<C> {
    inner: C,
    addr: String,
    counters: ByteCounters,
    totals: Option<ByteCounters>,
}

impl<C> LoggingConn<C> {
    /// Wrap a connection
    pub fn new(inner: C, addr: &str) -> Self {
        Self {
            inner,
            addr: addr.to_string(),
            counters: ByteCounters::default(),
            totals: None,
        }
    }

    fn with_counters(inner: C, addr: &str, totals: ByteCounters) -> Self {
        Self {
            inner,
            addr: addr.to_string(),
            counters: ByteCounters::default(),
            totals: Some(totals),
        }
    }

    /// Counters for this connection
    pub fn counters(&self) -> ByteCounters {
        self.counters.clone()
    }

    fn add_read(&self, n: usize) {
        self.counters.read.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(totals) = &self.totals {
            totals.read.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    fn add_written(&self, n: usize) {
        self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(totals) = &self.totals {
            totals.written.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for LoggingConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        self.add_read(n);
        trace!("{}: read {} bytes", self.addr, n);
        Poll::Ready(Ok(()))
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for LoggingConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.add_written(n);
        trace!("{}: wrote {} bytes", self.addr, n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        trace!("{}: close write", self.addr);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<C: StreamConn> StreamConn for LoggingConn<C> {
    fn half_close_mode(&self) -> HalfCloseMode {
        self.inner.half_close_mode()
    }

    fn close_read(&mut self) -> io::Result<()> {
        trace!("{}: close read", self.addr);
        self.inner.close_read()
    }
}

impl<C> Drop for LoggingConn<C> {
    fn drop(&mut self) {
        debug!(
            "{}: closed after {} bytes read, {} bytes written",
            self.addr,
            self.counters.bytes_read(),
            self.counters.bytes_written()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PlainConn, StreamConnExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_logging_counts_without_altering() {
        let (a, b) = tokio::io::duplex(1024);
        let mut conn = LoggingConn::new(PlainConn::new(a), "test:1");
        let mut peer = PlainConn::new(b);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        let counters = conn.counters();
        assert_eq!(counters.bytes_written(), 4);
        assert_eq!(counters.bytes_read(), 5);
    }

    #[tokio::test]
    async fn test_logging_forwards_half_close() {
        let (a, b) = tokio::io::duplex(1024);
        let mut conn = LoggingConn::new(PlainConn::new(a), "test:2");
        let mut peer = PlainConn::new(b);

        assert_eq!(conn.half_close_mode(), HalfCloseMode::Independent);
        conn.close_read().unwrap();
        conn.write_all(b"data").await.unwrap();
        conn.close_write().await.unwrap();

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"data");
    }
}
