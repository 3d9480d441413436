//! # dialchain
//!
//! Composable stream-dialer transport chain for censorship-resistant
//! proxying.
//!
//! Every transform takes an inner [`StreamDialer`](transport::StreamDialer)
//! and is itself one, so a chain is built by wrapping:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Local listeners (HTTP, SOCKS5)              │
//! ├─────────────────────────────────────────────────────┤
//! │      Fallback policy (proxyless first, then proxy)   │
//! ├─────────────────────────────────────────────────────┤
//! │                     Logging                          │
//! ├─────────────────────────────────────────────────────┤
//! │            Multiplexer (pooled sessions)             │
//! ├─────────────────────────────────────────────────────┤
//! │         Primary protocol (shadowsocks, algeneva)     │
//! ├─────────────────────────────────────────────────────┤
//! │     Packet manipulation (split, tlsfrag, disorder)   │
//! ├─────────────────────────────────────────────────────┤
//! │                       TCP                            │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Chains are assembled by a [`Registry`](registry::Registry) from a
//! [`ProxyConfig`](registry::ProxyConfig).

pub mod algeneva;
pub mod config;
pub mod crypto;
pub mod multiplex;
pub mod obfuscation;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod shadowsocks;
pub mod transport;

pub use config::Config;
pub use registry::{DialerChain, ProxyConfig, Registry};
pub use transport::{BoxConn, SharedDialer, StreamConn, StreamDialer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Shadowsocks error: {0}")]
    Shadowsocks(#[from] shadowsocks::ShadowsocksError),

    #[error("Packet manipulation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("HTTP mutation error: {0}")]
    Algeneva(#[from] algeneva::AlgenevaError),

    #[error("Multiplex error: {0}")]
    Multiplex(#[from] multiplex::MuxError),

    #[error("Proxy configuration error: {0}")]
    ProxyConfig(#[from] registry::ConfigError),

    #[error("Chain error: {0}")]
    Chain(#[from] registry::ChainError),

    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
