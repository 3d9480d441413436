//! Raw TCP transport, the innermost layer of every chain

use super::{
    BoxConn, CloseState, HalfCloseMode, StreamConn, StreamDialer, TransportConfig, TransportError,
};
use async_trait::async_trait;
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Raw TCP dialer
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Dial and keep the concrete connection type, for layers that need
    /// socket options (see the disorder technique)
    pub async fn dial_tcp(&self, addr: &str) -> Result<TcpConn, TransportError> {
        let timeout = std::time::Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }

        debug!("TCP connected to {}", addr);
        TcpConn::new(stream)
    }
}

#[async_trait]
impl StreamDialer for TcpDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        Ok(Box::new(self.dial_tcp(addr).await?))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// TCP connection with native half-close.
///
/// The socket is dropped on the call that closes the second direction.
pub struct TcpConn {
    stream: Option<TcpStream>,
    state: CloseState,
    peer: SocketAddr,
}

impl TcpConn {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            state: CloseState::new(),
            peer,
        })
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Check if the socket has been released
    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    /// Current IP TTL (IPv4) or unicast hop limit (IPv6)
    pub fn hop_limit(&self) -> io::Result<u32> {
        let stream = self.stream()?;
        let sock = SockRef::from(stream);
        if self.peer.is_ipv6() {
            sock.unicast_hops_v6()
        } else {
            sock.ttl()
        }
    }

    /// Set IP TTL (IPv4) or unicast hop limit (IPv6)
    pub fn set_hop_limit(&self, hops: u32) -> io::Result<()> {
        let stream = self.stream()?;
        let sock = SockRef::from(stream);
        if self.peer.is_ipv6() {
            sock.set_unicast_hops_v6(hops)
        } else {
            sock.set_ttl(hops)
        }
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!("TCP connection to {} released", self.peer);
        }
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.state.is_read_closed() {
            return Poll::Ready(Ok(()));
        }
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.state.is_write_closed() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.state.is_write_closed() {
            return Poll::Ready(Ok(()));
        }
        if let Some(stream) = self.stream.as_mut() {
            let result = ready!(Pin::new(stream).poll_shutdown(cx));
            if let Err(e) = result {
                if e.kind() != io::ErrorKind::NotConnected {
                    return Poll::Ready(Err(e));
                }
            }
        }
        if self.state.close_write() {
            self.release();
        }
        Poll::Ready(Ok(()))
    }
}

impl StreamConn for TcpConn {
    fn half_close_mode(&self) -> HalfCloseMode {
        HalfCloseMode::Independent
    }

    fn close_read(&mut self) -> io::Result<()> {
        if self.state.is_read_closed() {
            return Ok(());
        }
        if let Some(stream) = self.stream.as_ref() {
            match SockRef::from(stream).shutdown(Shutdown::Read) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
        }
        if self.state.close_read() {
            self.release();
        }
        Ok(())
    }
}
