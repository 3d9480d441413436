//! Packet manipulation layer
//!
//! Techniques change how the first bytes of a stream are cut into writes
//! and segments, never what the bytes are:
//!
//! - `split:N`: the first N bytes go out in their own write
//! - `tlsfrag:N`: the first TLS handshake record is re-framed as two
//!   records, the first carrying N bytes of its payload
//! - `disorder:N`: the first N bytes are sent with TTL 1 so they arrive
//!   after the rest, through retransmission
//!
//! A technique list is written `name:param|name:param`. The leftmost
//! entry wraps the TCP connection directly and each following entry wraps
//! the previous one. `disorder` needs the raw socket and is only valid as
//! the first entry.

mod disorder;
mod split;
mod tlsfrag;

pub use disorder::DisorderConn;
pub use split::SplitConn;
pub use tlsfrag::TlsFragConn;

use crate::transport::{BoxConn, StreamDialer, TcpDialer, TransportError};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// Packet manipulation errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("Unknown technique: {0}")]
    UnknownTechnique(String),

    #[error("Invalid parameter for {technique}: {value}")]
    InvalidParam { technique: String, value: String },

    #[error("disorder must be the innermost technique")]
    DisorderNotInnermost,

    #[error("Empty technique list")]
    Empty,
}

/// One packet manipulation technique
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technique {
    Split(usize),
    TlsFrag(usize),
    Disorder(usize),
}

impl Technique {
    /// Parse a `name:param|name:param` list
    pub fn parse_list(s: &str) -> Result<Vec<Technique>, ObfuscationError> {
        let techniques = s
            .split('|')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if techniques.is_empty() {
            return Err(ObfuscationError::Empty);
        }
        if techniques
            .iter()
            .skip(1)
            .any(|t| matches!(t, Technique::Disorder(_)))
        {
            return Err(ObfuscationError::DisorderNotInnermost);
        }
        Ok(techniques)
    }

    fn name(&self) -> &'static str {
        match self {
            Technique::Split(_) => "split",
            Technique::TlsFrag(_) => "tlsfrag",
            Technique::Disorder(_) => "disorder",
        }
    }

    fn param(&self) -> usize {
        match self {
            Technique::Split(n) | Technique::TlsFrag(n) | Technique::Disorder(n) => *n,
        }
    }
}

impl FromStr for Technique {
    type Err = ObfuscationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once(':')
            .ok_or_else(|| ObfuscationError::UnknownTechnique(s.to_string()))?;

        let param = |min: usize| -> Result<usize, ObfuscationError> {
            value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n >= min)
                .ok_or_else(|| ObfuscationError::InvalidParam {
                    technique: name.to_string(),
                    value: value.to_string(),
                })
        };

        match name.trim() {
            "split" => Ok(Technique::Split(param(1)?)),
            "tlsfrag" => Ok(Technique::TlsFrag(param(1)?)),
            "disorder" => Ok(Technique::Disorder(param(1)?)),
            other => Err(ObfuscationError::UnknownTechnique(other.to_string())),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.param())
    }
}

/// TCP dialer with packet manipulation applied to every connection
#[derive(Debug, Clone)]
pub struct PacketDialer {
    tcp: TcpDialer,
    techniques: Vec<Technique>,
}

impl PacketDialer {
    /// Create a dialer from parsed techniques
    pub fn new(tcp: TcpDialer, techniques: Vec<Technique>) -> Result<Self, ObfuscationError> {
        if techniques
            .iter()
            .skip(1)
            .any(|t| matches!(t, Technique::Disorder(_)))
        {
            return Err(ObfuscationError::DisorderNotInnermost);
        }
        Ok(Self { tcp, techniques })
    }

    /// Create a dialer from a technique list
    pub fn parse(tcp: TcpDialer, config: &str) -> Result<Self, ObfuscationError> {
        Self::new(tcp, Technique::parse_list(config)?)
    }

    /// Techniques, innermost first
    pub fn techniques(&self) -> &[Technique] {
        &self.techniques
    }

    /// Canonical `name:param|...` form
    pub fn config_string(&self) -> String {
        self.techniques
            .iter()
            .map(Technique::to_string)
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[async_trait]
impl StreamDialer for PacketDialer {
    async fn dial_stream(&self, addr: &str) -> Result<BoxConn, TransportError> {
        let tcp = self.tcp.dial_tcp(addr).await?;

        let mut rest = self.techniques.iter();
        let mut conn: BoxConn = match self.techniques.first() {
            Some(Technique::Disorder(n)) => {
                rest.next();
                Box::new(DisorderConn::new(tcp, *n))
            }
            _ => Box::new(tcp),
        };

        for technique in rest {
            conn = match *technique {
                Technique::Split(n) => Box::new(SplitConn::new(conn, n)),
                Technique::TlsFrag(n) => Box::new(TlsFragConn::new(conn, n)),
                Technique::Disorder(_) => return Err(TransportError::ConnectionFailed(
                    ObfuscationError::DisorderNotInnermost.to_string(),
                )),
            };
        }

        trace!("{} via {}", addr, self.config_string());
        Ok(conn)
    }

    fn name(&self) -> &'static str {
        "packet"
    }
}
