//! Proxyless and fallback dialers

use super::history::{AttemptHistory, Outcome};
use crate::obfuscation::PacketDialer;
use crate::transport::{split_host_port, BoxConn, SharedDialer, StreamDialer, TransportError};
use async_trait::async_trait;
use ring::digest;
use std::sync::Arc;
use tracing::{debug, info};

/// Stable fingerprint of a proxyless configuration string
pub fn config_fingerprint(config: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, config.as_bytes()))
}

/// Direct dialer gated by the attempt history
pub struct ProxylessDialer {
    inner: SharedDialer,
    fingerprint: String,
    history: Arc<AttemptHistory>,
}

impl ProxylessDialer {
    /// Gate a packet-manipulation dialer; its technique list is the
    /// configuration fingerprinted
    pub fn new(packet: PacketDialer, history: Arc<AttemptHistory>) -> Self {
        let fingerprint = config_fingerprint(&packet.config_string());
        Self::with_fingerprint(Arc::new(packet), fingerprint, history)
    }

    /// Gate any dialer under an explicit fingerprint
    pub fn with_fingerprint(
        inner: SharedDialer,
        fingerprint: impl Into<String>,
        history: Arc<AttemptHistory>,
    ) -> Self {
        Self {
            inner,
            fingerprint: fingerprint.into(),
            history,
        }
    }

    /// Fingerprint recorded with each attempt
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Shared history
    pub fn history(&self) -> &Arc<AttemptHistory> {
        &self.history
    }
}

#[async_trait]
impl StreamDialer for ProxylessDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        let (domain, _) = split_host_port(addr)?;

        let Some(reason) = self.history.decide(domain, &self.fingerprint) else {
            return Err(TransportError::ConditionsNotMet(domain.to_string()));
        };
        debug!("proxyless: trying {} ({:?})", addr, reason);

        let result = self.inner.dial_stream(addr).await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.history.record(domain, &self.fingerprint, outcome);
        result
    }

    fn name(&self) -> &'static str {
        "proxyless"
    }

    fn rewrites_http(&self) -> bool {
        self.inner.rewrites_http()
    }
}

/// Tries a primary dialer and falls back to a second one on any error
pub struct FallbackDialer {
    primary: SharedDialer,
    fallback: SharedDialer,
}

impl FallbackDialer {
    pub fn new(primary: SharedDialer, fallback: SharedDialer) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl StreamDialer for FallbackDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        match self.primary.dial_stream(addr).await {
            Ok(conn) => Ok(conn),
            Err(TransportError::ConditionsNotMet(_)) => {
                debug!("{} skipped for {}, using {}", self.primary.name(), addr, self.fallback.name());
                self.fallback.dial_stream(addr).await
            }
            Err(e) => {
                info!("{} failed for {}: {}, using {}", self.primary.name(), addr, e, self.fallback.name());
                self.fallback.dial_stream(addr).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "fallback"
    }

    fn rewrites_http(&self) -> bool {
        self.primary.rewrites_http() || self.fallback.rewrites_http()
    }
}
