//! Dialer composition
//!
//! Every chain has the same shape:
//!
//! ```text
//! tcp -> [packet techniques] -> <protocol> -> multiplex -> logging
//! ```
//!
//! The protocol stage is looked up by name in a [`Registry`]. Registries
//! are plain values: build one, register builders, pass it by reference.

use crate::algeneva::{AlgenevaDialer, AlgenevaError, Strategy};
use crate::multiplex::{MuxConfig, MuxDialer, MuxError};
use crate::obfuscation::{ObfuscationError, PacketDialer};
use crate::shadowsocks::{ShadowsocksConfig, ShadowsocksDialer, ShadowsocksError};
use crate::transport::{
    join_host_port, BoxConn, ByteCounters, LoggingDialer, SharedDialer, StreamDialer,
    TcpDialer, TransportConfig, TransportError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors in a proxy configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Missing parameter {param} for {protocol}")]
    MissingParam {
        protocol: String,
        param: &'static str,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Shadowsocks: {0}")]
    Shadowsocks(#[from] ShadowsocksError),

    #[error("Algeneva: {0}")]
    Algeneva(#[from] AlgenevaError),

    #[error("Packet manipulation: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("Multiplex: {0}")]
    Multiplex(#[from] MuxError),
}

/// Chain construction failure, attributed to the stage that failed
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: &'static str,
        source: ConfigError,
    },
}

impl ChainError {
    fn stage(stage: &'static str) -> impl FnOnce(ConfigError) -> Self {
        move |source| ChainError::Stage { stage, source }
    }
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Protocol {0} is already registered")]
    Duplicate(String),
}

/// Proxy endpoint as configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Server host
    pub server: String,
    /// Server port
    pub port: u16,
    /// Primary protocol name
    pub protocol: String,
    /// Protocol parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl ProxyConfig {
    /// `host:port` of the server
    pub fn address(&self) -> String {
        join_host_port(&self.server, self.port)
    }
}

/// What a protocol builder receives
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// `host:port` every dial of this protocol connects to
    pub server: String,
    params: Arc<HashMap<String, String>>,
}

impl ProtocolConfig {
    pub fn new(server: impl Into<String>, params: HashMap<String, String>) -> Self {
        Self {
            server: server.into(),
            params: Arc::new(params),
        }
    }

    /// Look up a parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// All parameters
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}

/// Builds a protocol dialer on top of an inner dialer
pub type BuildFn =
    Box<dyn Fn(SharedDialer, &ProtocolConfig) -> Result<SharedDialer, ConfigError> + Send + Sync>;

/// Protocol builders by name
pub struct Registry {
    builders: HashMap<String, BuildFn>,
    transport: TransportConfig,
    multiplex: MuxConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
            transport: TransportConfig::default(),
            multiplex: MuxConfig::default(),
        }
    }

    /// Registry with `shadowsocks` and `algeneva`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.builders.insert("shadowsocks".into(), Box::new(build_shadowsocks));
        registry.builders.insert("algeneva".into(), Box::new(build_algeneva));
        registry
    }

    /// TCP settings for the transport stage
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Settings for the multiplex stage
    pub fn with_multiplex(mut self, multiplex: MuxConfig) -> Self {
        self.multiplex = multiplex;
        self
    }

    /// Register a builder; names are unique
    pub fn register<F>(&mut self, name: &str, build: F) -> Result<(), RegistryError>
    where
        F: Fn(SharedDialer, &ProtocolConfig) -> Result<SharedDialer, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        if self.builders.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.builders.insert(name.to_string(), Box::new(build));
        Ok(())
    }

    /// Registered protocol names, sorted
    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the dialer chain for `config`
    pub fn build_chain(&self, config: &ProxyConfig) -> Result<DialerChain, ChainError> {
        let mut stages = Vec::new();
        let protocol = ProtocolConfig::new(config.address(), config.params.clone());

        // transport
        let tcp = TcpDialer::new(self.transport.clone());
        stages.push("tcp".to_string());
        let transport: SharedDialer = match protocol.param("packet") {
            Some(techniques) => {
                let packet = PacketDialer::parse(tcp, techniques)
                    .map_err(|e| ChainError::stage("transport")(e.into()))?;
                stages.push("packet".to_string());
                Arc::new(packet)
            }
            None => Arc::new(tcp),
        };

        // protocol
        let build = self
            .builders
            .get(&config.protocol)
            .ok_or_else(|| ConfigError::UnknownProtocol(config.protocol.clone()))
            .map_err(ChainError::stage("protocol"))?;
        if config.server.is_empty() || config.port == 0 {
            return Err(ChainError::stage("protocol")(ConfigError::Invalid {
                field: "server",
                reason: format!("{:?} is not a usable endpoint", config.address()),
            }));
        }
        let primary = build(transport, &protocol).map_err(ChainError::stage("protocol"))?;
        stages.push(config.protocol.clone());

        // multiplex
        let mux = MuxDialer::new(primary, self.multiplex.clone())
            .map_err(|e| ChainError::stage("multiplex")(e.into()))?;
        stages.push("multiplex".to_string());

        // logging
        let logging = Arc::new(LoggingDialer::new(Arc::new(mux)));
        stages.push("logging".to_string());

        info!("built chain {} for {}", stages.join(" -> "), protocol.server);
        Ok(DialerChain {
            stages,
            server: protocol.server,
            logging,
        })
    }
}

fn build_shadowsocks(inner: SharedDialer, config: &ProtocolConfig) -> Result<SharedDialer, ConfigError> {
    let ss = ShadowsocksConfig::from_params(config.params())?;
    Ok(Arc::new(ShadowsocksDialer::new(inner, config.server.clone(), ss)?))
}

fn build_algeneva(inner: SharedDialer, config: &ProtocolConfig) -> Result<SharedDialer, ConfigError> {
    let strategy: Strategy = config
        .param("strategy")
        .ok_or(ConfigError::MissingParam {
            protocol: "algeneva".into(),
            param: "strategy",
        })?
        .parse()?;
    Ok(Arc::new(AlgenevaDialer::new(inner, config.server.clone(), strategy)))
}

/// A built chain: its stage names and the outermost dialer
pub struct DialerChain {
    stages: Vec<String>,
    server: String,
    logging: Arc<LoggingDialer>,
}

impl DialerChain {
    /// Stage names, innermost first
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Server every dial connects to
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Outermost dialer
    pub fn dialer(&self) -> SharedDialer {
        self.logging.clone()
    }

    /// Bytes moved through the chain so far
    pub fn totals(&self) -> ByteCounters {
        self.logging.totals()
    }
}

impl fmt::Debug for DialerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialerChain")
            .field("stages", &self.stages)
            .field("server", &self.server)
            .finish()
    }
}

#[async_trait]
impl StreamDialer for DialerChain {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        self.logging.dial_stream(addr).await
    }

    fn name(&self) -> &'static str {
        "chain"
    }

    fn rewrites_http(&self) -> bool {
        self.logging.rewrites_http()
    }
}
