//! Shadowsocks AEAD transform
//!
//! The dialer always connects to the configured server. The destination
//! handed to `dial_stream` is only a logical marker: the target header on
//! the wire names a random decoy upstream instead, so the encrypted stream
//! carries nothing that correlates with the real destination.

mod salt;
mod stream;

pub use salt::SaltGenerator;
pub use stream::{ShadowsocksConn, MAX_PAYLOAD};

use crate::crypto::{CipherKind, CryptoError};
use crate::transport::{BoxConn, SharedDialer, StreamDialer, TransportError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Suffix used for decoy upstreams unless configured otherwise
pub const DEFAULT_UPSTREAM_SUFFIX: &str = "com";

/// Port of every decoy upstream
pub const DECOY_PORT: u16 = 443;

const DECOY_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Shadowsocks errors
#[derive(Debug, Error)]
pub enum ShadowsocksError {
    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Salt prefix of {prefix_len} bytes exceeds salt length {salt_len}")]
    PrefixTooLong { prefix_len: usize, salt_len: usize },

    #[error("Invalid salt prefix {0}")]
    InvalidPrefix(String),

    #[error("Invalid upstream suffix: {0}")]
    InvalidSuffix(String),
}

/// Shadowsocks parameters
#[derive(Debug, Clone)]
pub struct ShadowsocksConfig {
    /// AEAD method
    pub cipher: CipherKind,
    /// Shared secret
    pub secret: String,
    /// Salt generator (random unless a prefix is configured)
    pub salt: SaltGenerator,
    /// Suffix of the decoy upstream hostname
    pub upstream_suffix: String,
}

impl ShadowsocksConfig {
    /// Create a config with random salts
    pub fn new(cipher: CipherKind, secret: impl Into<String>) -> Self {
        Self {
            cipher,
            secret: secret.into(),
            salt: SaltGenerator::random(),
            upstream_suffix: DEFAULT_UPSTREAM_SUFFIX.to_string(),
        }
    }

    /// Read `cipher`, `secret`, `prefix` and `upstream_suffix` from a
    /// parameter map
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ShadowsocksError> {
        let cipher: CipherKind = params
            .get("cipher")
            .ok_or(ShadowsocksError::MissingParam("cipher"))?
            .parse()?;
        let secret = params
            .get("secret")
            .ok_or(ShadowsocksError::MissingParam("secret"))?;

        let mut config = Self::new(cipher, secret.clone());

        if let Some(prefix) = params.get("prefix").filter(|p| !p.is_empty()) {
            config.salt = SaltGenerator::parse(prefix)?;
        }
        if let Some(suffix) = params.get("upstream_suffix") {
            config.upstream_suffix = suffix.trim_start_matches('.').to_string();
        }

        Ok(config)
    }

    /// Validate the parts that can fail at dial time
    pub fn validate(&self) -> Result<(), ShadowsocksError> {
        self.salt.check(self.cipher.salt_len())?;
        if self.upstream_suffix.is_empty()
            || !self
                .upstream_suffix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
        {
            return Err(ShadowsocksError::InvalidSuffix(self.upstream_suffix.clone()));
        }
        Ok(())
    }
}

/// Random decoy upstream `[a-zA-Z]{2,22}.<suffix>:443`
pub fn decoy_upstream(suffix: &str) -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(2..=22);
    let label: String = (0..len)
        .map(|_| DECOY_LETTERS[rng.gen_range(0..DECOY_LETTERS.len())] as char)
        .collect();
    format!("{}.{}:{}", label, suffix, DECOY_PORT)
}

/// Encode a SOCKS-style target address (`atyp addr port`)
pub fn encode_address(host: &str, port: u16) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(host.len() + 4);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(0x01);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(0x04);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.is_empty() || host.len() > 255 {
                return Err(TransportError::InvalidAddress(host.to_string()));
            }
            out.push(0x03);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(out)
}

/// Read a SOCKS-style target address, returning `host:port`
pub async fn read_address<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let atyp = reader.read_u8().await?;
    let host = match atyp {
        0x01 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        0x03 => {
            let len = reader.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "non UTF-8 domain in address")
            })?
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type {:#04x}", other),
            ))
        }
    };
    let port = reader.read_u16().await?;
    Ok(format!("{}:{}", host, port))
}

/// Dialer producing Shadowsocks connections to a fixed server
pub struct ShadowsocksDialer {
    inner: SharedDialer,
    server: String,
    kind: CipherKind,
    master: Arc<[u8]>,
    salt: SaltGenerator,
    upstream_suffix: String,
}

impl ShadowsocksDialer {
    /// Create a dialer for `server` (`host:port`)
    pub fn new(
        inner: SharedDialer,
        server: impl Into<String>,
        config: ShadowsocksConfig,
    ) -> Result<Self, ShadowsocksError> {
        config.validate()?;

        Ok(Self {
            inner,
            server: server.into(),
            kind: config.cipher,
            master: config.cipher.master_key(&config.secret).into(),
            salt: config.salt,
            upstream_suffix: config.upstream_suffix,
        })
    }

    /// Server address every dial connects to
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Generate a decoy upstream with this dialer's suffix
    pub fn decoy_upstream(&self) -> String {
        decoy_upstream(&self.upstream_suffix)
    }
}

#[async_trait]
impl StreamDialer for ShadowsocksDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        let upstream = self.decoy_upstream();
        trace!("shadowsocks: {} via decoy {}", addr, upstream);

        let salt = self
            .salt
            .generate(self.kind.salt_len())
            .map_err(|e| TransportError::protocol("shadowsocks", e.to_string()))?;
        let (host, port) = crate::transport::split_host_port(&upstream)?;
        let header = encode_address(host, port)?;

        let conn = self.inner.dial_stream(&self.server).await?;
        debug!("shadowsocks connected to {} ({})", self.server, self.kind);

        let conn = ShadowsocksConn::client(conn, self.kind, self.master.clone(), salt, header)
            .map_err(|e| TransportError::protocol("shadowsocks", e.to_string()))?;
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "shadowsocks"
    }

    fn rewrites_http(&self) -> bool {
        self.inner.rewrites_http()
    }
}

/// Server-side acceptor for the development endpoint
#[derive(Clone)]
pub struct ShadowsocksAcceptor {
    kind: CipherKind,
    master: Arc<[u8]>,
}

impl ShadowsocksAcceptor {
    /// Create an acceptor
    pub fn new(config: &ShadowsocksConfig) -> Self {
        Self {
            kind: config.cipher,
            master: config.cipher.master_key(&config.secret).into(),
        }
    }

    /// Accept one connection, returning it and the target it names
    pub async fn accept<C: crate::transport::StreamConn>(
        &self,
        conn: C,
    ) -> Result<(ShadowsocksConn<C>, String), TransportError> {
        ShadowsocksConn::accept(conn, self.kind, self.master.clone()).await
    }
}
