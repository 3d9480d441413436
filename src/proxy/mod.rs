//! Local proxy listeners
//!
//! Provides:
//! - HTTP proxy server (CONNECT, Upgrade and plain requests)
//! - SOCKS5 proxy server (CONNECT)
//! - [`relay`]: the bidirectional splice both listeners end in
//!
//! Every accepted client moves through awaiting-request, dialing-target,
//! relaying and closed. Errors at any point go straight to closed.

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

mod relay;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

#[cfg(feature = "http-proxy")]
pub use http::HttpProxyServer;

pub use relay::{relay, RelayOutcome};

use crate::transport::{join_host_port, TransportError};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Header carrying the auth token unless configured otherwise
pub const DEFAULT_AUTH_HEADER: &str = "X-Proxy-Auth-Token";

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Dial failed: {0}")]
    Dial(#[from] TransportError),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Classify a host string
    pub fn new(host: &str, port: u16) -> Self {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Address::Ipv4(ip.octets(), port)
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Address::Ipv6(ip.octets(), port)
        } else {
            Address::Domain(host.to_string(), port)
        }
    }

    /// Parse an authority (`host[:port]`), using `default_port` when the
    /// port is absent
    pub fn parse_authority(authority: &str, default_port: u16) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(authority.to_string());

        // Bracketed IPv6, with or without port
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => default_port,
                None => return Err(invalid()),
            };
            let ip: Ipv6Addr = host.parse().map_err(|_| invalid())?;
            return Ok(Address::Ipv6(ip.octets(), port));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (authority, default_port),
        };
        if host.is_empty() || host.contains(':') {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host without brackets or port
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Ipv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", join_host_port(&self.host(), self.port()))
    }
}
