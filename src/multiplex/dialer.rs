//! Pooled multiplexing dialer

use super::{MuxConfig, MuxError, Session};
use crate::transport::{BoxConn, SharedDialer, StreamDialer, TransportError};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Address handed to the inner dialer when opening a physical session.
///
/// Layers beneath the multiplexer that connect to a fixed server ignore
/// it; the real destination travels in each stream open frame.
pub const MUX_DESTINATION: &str = "mux.invalid:443";

/// Dialer that carries every dial as a logical stream over a small pool
/// of physical sessions
pub struct MuxDialer {
    inner: SharedDialer,
    config: MuxConfig,
    pool: Mutex<Vec<Session>>,
}

impl MuxDialer {
    /// Wrap an inner dialer
    pub fn new(inner: SharedDialer, config: MuxConfig) -> Result<Self, MuxError> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            pool: Mutex::new(Vec::new()),
        })
    }

    /// Number of live physical sessions
    pub async fn sessions(&self) -> usize {
        let mut pool = self.pool.lock().await;
        pool.retain(|s| !s.is_closed());
        pool.len()
    }

    /// Pick a session for a new stream, opening a physical connection when
    /// none is usable or the pool has room and every session is busy
    async fn session(&self) -> Result<Session, TransportError> {
        let mut pool = self.pool.lock().await;
        pool.retain(|s| !s.is_closed() && !s.ids_exhausted());

        let best = pool
            .iter()
            .filter(|s| s.can_open())
            .min_by_key(|s| s.active_streams())
            .cloned();

        match best {
            Some(session) if session.active_streams() == 0 || pool.len() >= self.config.pool_size => {
                return Ok(session);
            }
            None if pool.len() >= self.config.pool_size => {
                return Err(MuxError::PoolExhausted(pool.len()).into());
            }
            _ => {}
        }

        let conn = self.inner.dial_stream(MUX_DESTINATION).await?;
        let session = Session::client(conn, self.config.clone());
        pool.push(session.clone());
        info!(
            "[multiplex] opened physical session via {} ({} in pool)",
            self.inner.name(),
            pool.len()
        );
        Ok(session)
    }
}

#[async_trait]
impl StreamDialer for MuxDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        let session = self.session().await?;
        let stream = session.open_stream(addr).await?;
        debug!("[multiplex] stream {} to {}", stream.id(), addr);
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "multiplex"
    }

    fn rewrites_http(&self) -> bool {
        self.inner.rewrites_http()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PlainConn;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Inner dialer backed by in-memory pipes; records every address dialed
    /// and serves the far end as a mux server echoing each stream
    #[derive(Default)]
    struct PipeDialer {
        dialed: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamDialer for PipeDialer {
        async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
            self.dialed.lock().push(addr.to_string());
            let (a, b) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let (_session, mut incoming) =
                    Session::server(Box::new(PlainConn::new(b)), MuxConfig::default());
                while let Some(mut stream) = incoming.accept().await {
                    tokio::spawn(async move {
                        let dest = stream.destination().to_string();
                        stream.write_all(dest.as_bytes()).await.ok();
                        stream.shutdown().await.ok();
                    });
                }
            });
            Ok(Box::new(PlainConn::new(a)))
        }

        fn name(&self) -> &'static str {
            "pipe"
        }
    }

    #[tokio::test]
    async fn test_streams_share_one_session() {
        let inner = Arc::new(PipeDialer::default());
        let dialer = MuxDialer::new(inner.clone(), MuxConfig::default()).unwrap();

        let mut first = dialer.dial_stream("one.example:443").await.unwrap();
        let mut second = dialer.dial_stream("two.example:80").await.unwrap();

        let mut buf = Vec::new();
        first.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"one.example:443");
        buf.clear();
        second.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"two.example:80");

        assert_eq!(*inner.dialed.lock(), vec![MUX_DESTINATION.to_string()]);
        assert_eq!(dialer.sessions().await, 1);
    }

    #[tokio::test]
    async fn test_pool_grows_then_exhausts() {
        let inner = Arc::new(PipeDialer::default());
        let config = MuxConfig {
            pool_size: 2,
            max_streams: 1,
            ..MuxConfig::default()
        };
        let dialer = MuxDialer::new(inner.clone(), config).unwrap();

        let _a = dialer.dial_stream("a.example:443").await.unwrap();
        let _b = dialer.dial_stream("b.example:443").await.unwrap();
        assert_eq!(inner.dialed.lock().len(), 2);

        match dialer.dial_stream("c.example:443").await {
            Err(TransportError::Protocol { layer, .. }) => assert_eq!(layer, "multiplex"),
            other => panic!("expected pool exhaustion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_empty_pool() {
        let config = MuxConfig {
            pool_size: 0,
            ..MuxConfig::default()
        };
        assert!(MuxDialer::new(Arc::new(PipeDialer::default()), config).is_err());
    }
}
