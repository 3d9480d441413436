//! Outbound mutated-CONNECT dialer and the inbound acceptor

use super::request::{parse_status, read_head, Normalizer, Request};
use super::{AlgenevaError, Strategy};
use crate::transport::{BoxConn, SharedDialer, StreamConn, StreamDialer, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

impl From<AlgenevaError> for TransportError {
    fn from(e: AlgenevaError) -> Self {
        match e {
            AlgenevaError::Io(e) => TransportError::Io(e),
            other => TransportError::protocol("algeneva", other.to_string()),
        }
    }
}

/// Dialer that opens each stream with a mutated `CONNECT` to a fixed server
pub struct AlgenevaDialer {
    inner: SharedDialer,
    server: String,
    strategy: Arc<Strategy>,
}

impl AlgenevaDialer {
    /// Create a dialer for `server` (`host:port`)
    pub fn new(inner: SharedDialer, server: impl Into<String>, strategy: Strategy) -> Self {
        if inner.rewrites_http() {
            warn!(
                "algeneva: inner dialer {} rewrites HTTP, mutations may be undone",
                inner.name()
            );
        }
        Self {
            inner,
            server: server.into(),
            strategy: Arc::new(strategy),
        }
    }

    /// Server address every dial connects to
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The request written for `addr`
    pub fn request_for(&self, addr: &str) -> Request {
        let mut request = Request::connect(addr);
        self.strategy.apply(&mut request);
        request
    }
}

#[async_trait]
impl StreamDialer for AlgenevaDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        let mut conn = self.inner.dial_stream(&self.server).await?;

        let request = self.request_for(addr);
        trace!("algeneva: sending {:?}", String::from_utf8_lossy(&request.to_bytes()));
        conn.write_all(&request.to_bytes()).await?;
        conn.flush().await?;

        let head = read_head(&mut conn).await?;
        let status = parse_status(&head)?;
        if status != 200 {
            return Err(TransportError::handshake(
                "algeneva",
                format!("server answered {}", status),
            ));
        }

        debug!("algeneva tunnel to {} via {}", addr, self.server);
        Ok(conn)
    }

    fn name(&self) -> &'static str {
        "algeneva"
    }

    fn rewrites_http(&self) -> bool {
        true
    }
}

/// Server side: reads a mutated request, normalizes it and answers `200`
#[derive(Debug, Clone, Default)]
pub struct AlgenevaAcceptor {
    normalizer: Normalizer,
}

impl AlgenevaAcceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one connection, returning it and the normalized request
    pub async fn accept<C: StreamConn>(&self, mut conn: C) -> Result<(C, Request), TransportError> {
        let head = read_head(&mut conn).await?;

        let request = match self.normalizer.normalize(&head) {
            Ok(request) if request.method == "CONNECT" && request.target().is_some() => request,
            Ok(request) => {
                conn.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
                return Err(TransportError::handshake(
                    "algeneva",
                    format!("expected CONNECT, got {}", request.method),
                ));
            }
            Err(e) => {
                conn.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Err(e.into());
            }
        };

        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        conn.flush().await?;
        Ok((conn, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PlainConn;
    use tokio::io::AsyncReadExt;

    struct PipeDialer {
        conn: parking_lot::Mutex<Option<BoxConn>>,
    }

    #[async_trait]
    impl StreamDialer for PipeDialer {
        async fn dial_stream(&self, _addr: &str) -> Result<BoxConn, TransportError> {
            self.conn.lock().take().ok_or(TransportError::Closed)
        }

        fn name(&self) -> &'static str {
            "pipe"
        }
    }

    fn pipe() -> (Arc<PipeDialer>, PlainConn<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        let dialer = PipeDialer {
            conn: parking_lot::Mutex::new(Some(Box::new(PlainConn::new(a)))),
        };
        (Arc::new(dialer), PlainConn::new(b))
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let (inner, server_end) = pipe();
        let strategy: Strategy = "[HTTP:host:*]-changecase{upper}-|".parse().unwrap();
        let dialer = AlgenevaDialer::new(inner, "proxy.test:80", strategy);

        let server = tokio::spawn(async move {
            let (mut conn, request) = AlgenevaAcceptor::new().accept(server_end).await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            (request, buf)
        });

        let mut conn = dialer.dial_stream("example.com:443").await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        let (request, buf) = server.await.unwrap();
        assert_eq!(request.target(), Some("example.com:443"));
        assert_eq!(request.header("host"), Some("EXAMPLE.COM:443"));
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_non_200_is_dial_failure() {
        let (inner, mut server_end) = pipe();
        let strategy: Strategy = "[HTTP:method:*]-duplicate-|".parse().unwrap();
        let dialer = AlgenevaDialer::new(inner, "proxy.test:80", strategy);

        tokio::spawn(async move {
            read_head(&mut server_end).await.unwrap();
            server_end
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        match dialer.dial_stream("example.com:443").await {
            Err(TransportError::Handshake { layer, .. }) => assert_eq!(layer, "algeneva"),
            other => panic!("expected handshake failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_acceptor_rejects_non_connect() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = PlainConn::new(a);
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        assert!(AlgenevaAcceptor::new().accept(PlainConn::new(b)).await.is_err());

        let mut reply = vec![0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 405");
    }
}
