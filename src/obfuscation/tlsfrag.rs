//! TLS record fragmentation
//!
//! The first record written is collected in full. If it is a handshake
//! record (content type 0x16) it goes out as two handshake records with
//! the same version, the first carrying `N` bytes of the payload. Any
//! other first record passes through untouched.

use crate::transport::{HalfCloseMode, StreamConn};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Re-frame `record` (a full handshake record) as two records
pub fn fragment_record(record: &[u8], first_len: usize) -> Vec<u8> {
    let payload = &record[RECORD_HEADER_LEN..];
    if first_len == 0 || first_len >= payload.len() {
        return record.to_vec();
    }

    let (head, tail) = payload.split_at(first_len);
    let mut out = Vec::with_capacity(record.len() + RECORD_HEADER_LEN);
    for part in [head, tail] {
        out.extend_from_slice(&record[..3]);
        out.extend_from_slice(&(part.len() as u16).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Splits the first TLS handshake record in two
pub struct TlsFragConn<C> {
    inner: C,
    first_len: usize,
    record: BytesMut,
    out: BytesMut,
    done: bool,
}

impl<C> TlsFragConn<C> {
    /// Fragment with `first_len` payload bytes in the first record
    pub fn new(inner: C, first_len: usize) -> Self {
        Self {
            inner,
            first_len,
            record: BytesMut::new(),
            out: BytesMut::new(),
            done: false,
        }
    }

    /// Bytes still needed to complete the first record
    fn needed(&self) -> usize {
        if self.record.len() < RECORD_HEADER_LEN {
            return RECORD_HEADER_LEN - self.record.len();
        }
        let payload_len = u16::from_be_bytes([self.record[3], self.record[4]]) as usize;
        RECORD_HEADER_LEN + payload_len - self.record.len()
    }

    fn finish(&mut self, reframe: bool) {
        let record = std::mem::take(&mut self.record);
        if reframe {
            trace!("tlsfrag: splitting {}-byte record at {}", record.len(), self.first_len);
            self.out.extend_from_slice(&fragment_record(&record, self.first_len));
        } else {
            self.out.extend_from_slice(&record);
        }
        self.done = true;
    }
}

impl<C: StreamConn> TlsFragConn<C> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<C: StreamConn> AsyncRead for TlsFragConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: StreamConn> AsyncWrite for TlsFragConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.done {
            ready!(this.poll_drain(cx))?;
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(this.needed());
        this.record.extend_from_slice(&buf[..take]);

        if this.record[0] != CONTENT_TYPE_HANDSHAKE {
            this.finish(false);
        } else if this.needed() == 0 {
            this.finish(true);
        }

        if this.done {
            if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
                return Poll::Ready(Err(e));
            }
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A flush with a partial record gives up on fragmenting it
        if !this.done && !this.record.is_empty() {
            this.finish(false);
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.done && !this.record.is_empty() {
            this.finish(false);
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<C: StreamConn> StreamConn for TlsFragConn<C> {
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

    fn handshake_record(payload: &[u8]) -> Vec<u8> {
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        record.extend_from_slice(payload);
        record
    }

    #[test]
    fn test_fragment_record() {
        let record = handshake_record(b"0123456789");
        let out = fragment_record(&record, 4);

        let mut expected = handshake_record(b"0123");
        expected.extend_from_slice(&handshake_record(b"456789"));
        assert_eq!(out, expected);

        // Nothing to split
        assert_eq!(fragment_record(&record, 10), record);
        assert_eq!(fragment_record(&record, 0), record);
    }

    #[tokio::test]
    async fn test_first_record_reframed() {
        let (inner, log) = RecordingConn::new();
        let mut conn = TlsFragConn::new(inner, 3);

        let mut data = handshake_record(b"client hello");
        data.extend_from_slice(b"trailing");
        conn.write_all(&data).await.unwrap();
        conn.flush().await.unwrap();

        let mut expected = handshake_record(b"cli");
        expected.extend_from_slice(&handshake_record(b"ent hello"));
        expected.extend_from_slice(b"trailing");
        assert_eq!(log.joined(), expected);
    }

    #[tokio::test]
    async fn test_non_handshake_passthrough() {
        let (inner, log) = RecordingConn::new();
        let mut conn = TlsFragConn::new(inner, 3);

        conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        conn.flush().await.unwrap();

        assert_eq!(log.joined(), b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_partial_record_flushed_unchanged() {
        let (inner, log) = RecordingConn::new();
        let mut conn = TlsFragConn::new(inner, 2);

        let record = handshake_record(b"abcdef");
        conn.write_all(&record[..7]).await.unwrap();
        conn.flush().await.unwrap();
        conn.write_all(&record[7..]).await.unwrap();

        assert_eq!(log.joined(), record);
    }
}
