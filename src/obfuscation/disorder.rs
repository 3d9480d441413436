//! Byte disordering through a short-lived TTL
//!
//! The first `N` bytes leave with a hop limit of 1 and are dropped by the
//! first router. The TTL is restored right after, so the remaining bytes
//! arrive first and the dropped segment follows as a retransmission.

use crate::transport::{HalfCloseMode, StreamConn, TcpConn};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// Sends the first `N` bytes with TTL 1
pub struct DisorderConn {
    inner: TcpConn,
    remaining: usize,
    default_hops: Option<u32>,
}

impl DisorderConn {
    /// Disorder the first `prefix` bytes
    pub fn new(inner: TcpConn, prefix: usize) -> Self {
        Self {
            inner,
            remaining: prefix,
            default_hops: None,
        }
    }

    fn restore(&mut self) -> io::Result<()> {
        if let Some(hops) = self.default_hops.take() {
            self.inner.set_hop_limit(hops)?;
            trace!("disorder: restored hop limit {}", hops);
        }
        Ok(())
    }
}

impl AsyncRead for DisorderConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DisorderConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.remaining == 0 || buf.is_empty() {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }

        if self.default_hops.is_none() {
            let hops = self.inner.hop_limit()?;
            self.inner.set_hop_limit(1)?;
            self.default_hops = Some(hops);
        }

        let take = buf.len().min(self.remaining);
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &buf[..take]))?;
        self.remaining -= n;
        if self.remaining == 0 {
            self.restore()?;
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Never leave the socket at TTL 1 for the FIN
        self.restore()?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl StreamConn for DisorderConn {
    fn half_close_mode(&self) -> HalfCloseMode {
        self.inner.half_close_mode()
    }

    fn close_read(&mut self) -> io::Result<()> {
        self.inner.close_read()
    }
}
