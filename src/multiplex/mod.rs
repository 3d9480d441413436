//! Stream multiplexer
//!
//! Carries many logical streams over one physical connection. A session
//! is driven by one driver task, which owns the write half and the stream
//! table, plus one reader task that decodes frames from the read half.
//!
//! The protocol has no per-direction close: `close_read`, `close_write`
//! and `close` on a [`MuxStream`] all close the whole logical stream
//! ([`HalfCloseMode::FullClose`](crate::transport::HalfCloseMode)).

mod dialer;
mod frame;
mod padding;
mod session;
mod stream;

pub use dialer::{MuxDialer, MUX_DESTINATION};
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_STREAM_ID};
pub use padding::{PaddingConfig, PaddingStrategy};
pub use session::{Incoming, Session};
pub use stream::{MuxStream, StreamState};

use crate::transport::TransportError;
use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Flow control violation on stream {0}")]
    FlowControl(u32),

    #[error("Stream limit reached ({0})")]
    TooManyStreams(usize),

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("All {0} sessions are at capacity")]
    PoolExhausted(usize),

    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MuxError> for TransportError {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::Io(e) => TransportError::Io(e),
            MuxError::SessionClosed | MuxError::StreamClosed => TransportError::Closed,
            other => TransportError::protocol("multiplex", other.to_string()),
        }
    }
}

/// Maximum number of concurrent streams per session
pub const MAX_STREAMS: usize = 1024;

/// Default window size for flow control (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;

/// Largest payload a stream puts in one data frame
pub const MAX_DATA_FRAME: usize = 16 * 1024;

/// Multiplexer settings
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Physical sessions kept by a [`MuxDialer`]
    pub pool_size: usize,
    /// Concurrent streams per session
    pub max_streams: usize,
    /// Per-stream flow control window
    pub window_size: u32,
    /// Seconds between keepalive pings, 0 disables them
    pub keepalive_interval: u64,
    /// Padding applied to data frames
    pub padding: Option<PaddingConfig>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            max_streams: MAX_STREAMS,
            window_size: DEFAULT_WINDOW_SIZE,
            keepalive_interval: 30,
            padding: None,
        }
    }
}

impl MuxConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.pool_size == 0 {
            return Err(MuxError::InvalidConfig("pool_size must be at least 1".into()));
        }
        if self.max_streams == 0 {
            return Err(MuxError::InvalidConfig("max_streams must be at least 1".into()));
        }
        if (self.window_size as usize) < MAX_DATA_FRAME {
            return Err(MuxError::InvalidConfig(format!(
                "window_size must be at least {}",
                MAX_DATA_FRAME
            )));
        }
        Ok(())
    }
}
