//! Configuration management

use crate::multiplex::{MuxConfig, PaddingConfig, PaddingStrategy};
use crate::proxy::DEFAULT_AUTH_HEADER;
use crate::registry::ProxyConfig;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local listeners
    #[serde(default)]
    pub client: ClientConfig,
    /// Remote proxy endpoint and protocol parameters
    pub proxy: ProxyConfig,
    /// Multiplexer settings
    #[serde(default)]
    pub multiplex: MultiplexConfig,
    /// Proxyless attempt policy
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Direct dialing with packet manipulation, tried before the proxy
    #[serde(default)]
    pub proxyless: Option<ProxylessConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Local listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local HTTP proxy address
    pub http_listen: Option<String>,
    /// Local SOCKS5 proxy address
    pub socks5_listen: Option<String>,
    /// Basic auth username for the local listeners
    pub username: Option<String>,
    /// Basic auth password for the local listeners
    pub password: Option<String>,
    /// Token injected into forwarded HTTP requests
    pub auth_token: Option<String>,
    /// Header carrying `auth_token`
    pub auth_header: String,
    /// TCP connect timeout in seconds
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_listen: Some("127.0.0.1:8080".to_string()),
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            username: None,
            password: None,
            auth_token: None,
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            connect_timeout: TransportConfig::default().connect_timeout,
        }
    }
}

impl ClientConfig {
    /// Credentials, when both halves are set
    pub fn credentials(&self) -> Option<(String, String)> {
        Some((self.username.clone()?, self.password.clone()?))
    }

    /// TCP settings for every chain
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            ..TransportConfig::default()
        }
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexConfig {
    /// Physical sessions kept open
    pub pool_size: usize,
    /// Concurrent streams per session
    pub max_streams: usize,
    /// Per-stream flow control window in bytes
    pub window_size: u32,
    /// Seconds between keepalive pings, 0 disables them
    pub keepalive_interval: u64,
    /// Frame padding: none, block:N, random:N or pow2
    pub padding: String,
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        let mux = MuxConfig::default();
        Self {
            pool_size: mux.pool_size,
            max_streams: mux.max_streams,
            window_size: mux.window_size,
            keepalive_interval: mux.keepalive_interval,
            padding: "none".to_string(),
        }
    }
}

impl MultiplexConfig {
    /// Convert to the multiplexer's own settings
    pub fn to_mux_config(&self) -> Result<MuxConfig, crate::Error> {
        let strategy: PaddingStrategy = self
            .padding
            .parse()
            .map_err(|e| crate::Error::Config(format!("multiplex.padding: {}", e)))?;

        let padding = match strategy {
            PaddingStrategy::None => None,
            strategy => Some(PaddingConfig {
                strategy,
                ..PaddingConfig::default()
            }),
        };

        let mux = MuxConfig {
            pool_size: self.pool_size,
            max_streams: self.max_streams,
            window_size: self.window_size,
            keepalive_interval: self.keepalive_interval,
            padding,
        };
        mux.validate()?;
        Ok(mux)
    }
}

/// Proxyless attempt policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Hours after which a failed destination is tried directly again
    pub staleness_hours: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            staleness_hours: crate::policy::DEFAULT_STALENESS.as_secs() / 3600,
        }
    }
}

impl PolicyConfig {
    /// Staleness window
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_hours * 3600)
    }
}

/// Proxyless dialing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxylessConfig {
    /// Packet manipulation techniques, e.g. `split:2|tlsfrag:5`
    pub techniques: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut params = HashMap::new();
    params.insert("cipher".to_string(), "chacha20-ietf-poly1305".to_string());
    params.insert("secret".to_string(), "change-me".to_string());
    params.insert("prefix".to_string(), "%16%03%01%00%C2%A8%01%01".to_string());

    Config {
        client: ClientConfig::default(),
        proxy: ProxyConfig {
            server: "proxy.example.com".to_string(),
            port: 8388,
            protocol: "shadowsocks".to_string(),
            params,
        },
        multiplex: MultiplexConfig::default(),
        policy: PolicyConfig::default(),
        proxyless: Some(ProxylessConfig {
            techniques: "split:2|tlsfrag:5".to_string(),
        }),
        logging: LoggingConfig::default(),
    }
}
