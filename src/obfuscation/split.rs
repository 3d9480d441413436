//! Stream splitting

use crate::transport::{HalfCloseMode, StreamConn};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Sends the first `N` bytes in a write of their own, flushed before any
/// later byte is written
pub struct SplitConn<C> {
    inner: C,
    remaining: usize,
    flush_pending: bool,
}

impl<C> SplitConn<C> {
    /// Split after `prefix` bytes
    pub fn new(inner: C, prefix: usize) -> Self {
        Self {
            inner,
            remaining: prefix,
            flush_pending: false,
        }
    }
}

impl<C: StreamConn> AsyncRead for SplitConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: StreamConn> AsyncWrite for SplitConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.flush_pending {
            ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
            self.flush_pending = false;
        }

        if self.remaining == 0 {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }

        let take = buf.len().min(self.remaining);
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &buf[..take]))?;
        self.remaining -= n;
        if self.remaining == 0 {
            self.flush_pending = true;
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
        self.flush_pending = false;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<C: StreamConn> StreamConn for SplitConn<C> {
    fn half_close_mode(&self) -> HalfCloseMode {
        self.inner.half_close_mode()
    }

    fn close_read(&mut self) -> io::Result<()> {
        self.inner.close_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::testing::RecordingConn;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_split_first_write() {
        let (inner, log) = RecordingConn::new();
        let mut conn = SplitConn::new(inner, 3);

        conn.write_all(b"hello world").await.unwrap();
        conn.write_all(b"!").await.unwrap();

        assert_eq!(
            log.writes(),
            vec![b"hel".to_vec(), b"lo world".to_vec(), b"!".to_vec()]
        );
        assert_eq!(conn.inner.flushes, 1);
    }

    #[tokio::test]
    async fn test_split_across_small_writes() {
        let (inner, log) = RecordingConn::new();
        let mut conn = SplitConn::new(inner, 4);

        conn.write_all(b"ab").await.unwrap();
        conn.write_all(b"cdef").await.unwrap();

        assert_eq!(
            log.writes(),
            vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()]
        );
        assert_eq!(log.joined(), b"abcdef");
    }
}
