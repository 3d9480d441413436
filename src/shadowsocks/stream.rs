//! AEAD chunk stream
//!
//! Wire format per direction: `salt`, then chunks of
//! `[len: u16 BE + tag][payload + tag]` with at most [`MAX_PAYLOAD`] bytes
//! of payload each.

use super::read_address;
use crate::crypto::{random_bytes, Cipher, CipherKind, CryptoError, TAG_LEN};
use crate::transport::{CloseState, HalfCloseMode, StreamConn, TransportError};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// Largest payload carried by one chunk
pub const MAX_PAYLOAD: usize = 0x3FFF;

const READ_SCRATCH: usize = 16 * 1024;

fn protocol_error(reason: impl Into<String>) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        TransportError::protocol("shadowsocks", reason),
    )
}

impl From<CryptoError> for io::Error {
    fn from(e: CryptoError) -> Self {
        protocol_error(e.to_string())
    }
}

/// Encrypted connection over an inner stream.
///
/// Half-close is forwarded to the inner connection; the mode is the
/// inner's.
pub struct ShadowsocksConn<C> {
    inner: C,
    kind: CipherKind,
    master: Arc<[u8]>,
    state: CloseState,

    enc: Cipher,
    pending_header: Option<Vec<u8>>,
    flush_on_read: bool,
    write_buf: BytesMut,

    dec: Option<Cipher>,
    next_len: Option<usize>,
    incoming: BytesMut,
    decrypted: BytesMut,
    read_eof: bool,
    scratch: Box<[u8]>,
}

impl<C: StreamConn> ShadowsocksConn<C> {
    fn new(
        inner: C,
        kind: CipherKind,
        master: Arc<[u8]>,
        salt: Vec<u8>,
        header: Option<Vec<u8>>,
    ) -> Result<Self, CryptoError> {
        let enc = Cipher::for_session(kind, &master, &salt)?;

        Ok(Self {
            inner,
            kind,
            master,
            state: CloseState::new(),
            enc,
            pending_header: header,
            flush_on_read: false,
            write_buf: BytesMut::from(&salt[..]),
            dec: None,
            next_len: None,
            incoming: BytesMut::new(),
            decrypted: BytesMut::new(),
            read_eof: false,
            scratch: vec![0u8; READ_SCRATCH].into_boxed_slice(),
        })
    }

    /// Client side: `salt` opens the outgoing stream and `header` (a
    /// target address) is sent with the first write, or before the first
    /// read if the caller reads first.
    pub fn client(
        inner: C,
        kind: CipherKind,
        master: Arc<[u8]>,
        salt: Vec<u8>,
        header: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        Self::new(inner, kind, master, salt, Some(header))
    }

    /// Server side with a fresh random salt
    pub fn server(inner: C, kind: CipherKind, master: Arc<[u8]>) -> Result<Self, CryptoError> {
        let mut salt = vec![0u8; kind.salt_len()];
        random_bytes(&mut salt)?;
        Self::new(inner, kind, master, salt, None)
    }

    /// Accept a client: read its salt and target address.
    ///
    /// Returns the connection and the requested `host:port`.
    pub async fn accept(
        inner: C,
        kind: CipherKind,
        master: Arc<[u8]>,
    ) -> Result<(Self, String), TransportError> {
        let mut conn = Self::server(inner, kind, master)
            .map_err(|e| TransportError::handshake("shadowsocks", e.to_string()))?;
        let target = read_address(&mut conn).await?;
        trace!("shadowsocks client requested {}", target);
        Ok((conn, target))
    }

    /// Get the inner connection
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    fn encode(&mut self, plaintext: &[u8]) -> Result<(), CryptoError> {
        for chunk in plaintext.chunks(MAX_PAYLOAD) {
            let mut len = (chunk.len() as u16).to_be_bytes().to_vec();
            self.enc.seal(&mut len)?;
            self.write_buf.extend_from_slice(&len);

            let mut payload = Vec::with_capacity(chunk.len() + TAG_LEN);
            payload.extend_from_slice(chunk);
            self.enc.seal(&mut payload)?;
            self.write_buf.extend_from_slice(&payload);
        }
        Ok(())
    }

    fn encode_pending_header(&mut self) -> Result<(), CryptoError> {
        if let Some(header) = self.pending_header.take() {
            self.encode(&header)?;
        }
        Ok(())
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Try to decode one step of the incoming stream.
    ///
    /// Returns false when more bytes are needed.
    fn decode(&mut self) -> io::Result<bool> {
        if self.dec.is_none() {
            let salt_len = self.kind.salt_len();
            if self.incoming.len() < salt_len {
                return Ok(false);
            }
            let salt = self.incoming.split_to(salt_len);
            self.dec = Some(Cipher::for_session(self.kind, &self.master, &salt)?);
            return Ok(true);
        }
        let Some(dec) = self.dec.as_mut() else {
            return Ok(false);
        };

        match self.next_len {
            None => {
                if self.incoming.len() < 2 + TAG_LEN {
                    return Ok(false);
                }
                let mut block = self.incoming.split_to(2 + TAG_LEN);
                let plain = dec.open(&mut block[..])?;
                let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                if len > MAX_PAYLOAD {
                    return Err(protocol_error(format!("chunk length {} too large", len)));
                }
                self.next_len = Some(len);
            }
            Some(len) => {
                if self.incoming.len() < len + TAG_LEN {
                    return Ok(false);
                }
                let mut block = self.incoming.split_to(len + TAG_LEN);
                let plain = dec.open(&mut block[..])?;
                self.decrypted.extend_from_slice(plain);
                self.next_len = None;
            }
        }
        Ok(true)
    }
}

impl<C: StreamConn> AsyncRead for ShadowsocksConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.state.is_read_closed() {
            return Poll::Ready(Ok(()));
        }

        // A read before any write still has to announce the target
        if this.pending_header.is_some() {
            this.encode_pending_header()?;
            this.flush_on_read = true;
        }
        if this.flush_on_read {
            ready!(this.poll_drain(cx))?;
            ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
            this.flush_on_read = false;
        }

        loop {
            if !this.decrypted.is_empty() {
                let n = this.decrypted.len().min(buf.remaining());
                buf.put_slice(&this.decrypted[..n]);
                this.decrypted.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            if this.decode()? {
                continue;
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                if this.incoming.is_empty() && this.next_len.is_none() {
                    this.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "shadowsocks: truncated chunk",
                )));
            }
            this.incoming.extend_from_slice(filled);
        }
    }
}

impl<C: StreamConn> AsyncWrite for ShadowsocksConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.state.is_write_closed() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = match this.pending_header.take() {
            Some(mut first) => {
                let n = buf.len().min(MAX_PAYLOAD - first.len());
                first.extend_from_slice(&buf[..n]);
                this.encode(&first)?;
                n
            }
            None => {
                let n = buf.len().min(MAX_PAYLOAD);
                this.encode(&buf[..n])?;
                n
            }
        };

        // Push what we can now; the rest goes out on the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.state.is_write_closed() {
            return Poll::Ready(Ok(()));
        }
        this.encode_pending_header()?;
        ready!(this.poll_drain(cx))?;
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        this.state.close_write();
        Poll::Ready(Ok(()))
    }
}

impl<C: StreamConn> StreamConn for ShadowsocksConn<C> {
    fn half_close_mode(&self) -> HalfCloseMode {
        self.inner.half_close_mode()
    }

    fn close_read(&mut self) -> io::Result<()> {
        if self.state.is_read_closed() {
            return Ok(());
        }
        self.state.close_read();
        self.inner.close_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::encode_address;
    use crate::transport::{PlainConn, StreamConnExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(kind: CipherKind) -> (ShadowsocksConn<PlainConn<tokio::io::DuplexStream>>, PlainConn<tokio::io::DuplexStream>, Arc<[u8]>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let master: Arc<[u8]> = kind.master_key("test-secret").into();
        let mut salt = vec![0u8; kind.salt_len()];
        random_bytes(&mut salt).unwrap();
        let header = encode_address("decoy.com", 443).unwrap();
        let client =
            ShadowsocksConn::client(PlainConn::new(a), kind, master.clone(), salt, header).unwrap();
        (client, PlainConn::new(b), master)
    }

    #[tokio::test]
    async fn test_client_server_exchange() {
        let kind = CipherKind::ChaCha20Poly1305;
        let (mut client, server_raw, master) = pair(kind);

        let server = tokio::spawn(async move {
            let (mut conn, target) = ShadowsocksConn::accept(server_raw, kind, master)
                .await
                .unwrap();
            assert_eq!(target, "decoy.com:443");
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.write_all(b"world").await.unwrap();
            conn.flush().await.unwrap();
            conn
        });

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_header_sent_before_first_read() {
        let kind = CipherKind::Aes128Gcm;
        let (mut client, server_raw, master) = pair(kind);

        let server = tokio::spawn(async move {
            let (mut conn, target) = ShadowsocksConn::accept(server_raw, kind, master)
                .await
                .unwrap();
            conn.write_all(target.as_bytes()).await.unwrap();
            conn.close_write().await.unwrap();
        });

        // Read first: the header must still reach the server
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"decoy.com:443");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_payload_is_chunked() {
        let kind = CipherKind::Aes256Gcm;
        let (mut client, server_raw, master) = pair(kind);
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server = tokio::spawn(async move {
            let (mut conn, _) = ShadowsocksConn::accept(server_raw, kind, master)
                .await
                .unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).await.unwrap();
            received
        });

        client.write_all(&payload).await.unwrap();
        client.close_write().await.unwrap();

        assert_eq!(server.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_wrong_key_is_protocol_error() {
        let kind = CipherKind::ChaCha20Poly1305;
        let (mut client, server_raw, _) = pair(kind);
        let wrong: Arc<[u8]> = kind.master_key("other-secret").into();

        let server = tokio::spawn(async move {
            ShadowsocksConn::accept(server_raw, kind, wrong).await
        });

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        assert!(server.await.unwrap().is_err());
    }
}
