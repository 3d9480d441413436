//! Half-close bookkeeping shared by connection wrappers
//!
//! Tracks the read and write directions separately and reports the single
//! transition at which both are closed, so that the owner releases its
//! underlying resource exactly once.

/// Connection close state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions open
    Open,
    /// Read side closed, writes still allowed
    ReadClosed,
    /// Write side closed (EOF sent), reads still allowed
    WriteClosed,
    /// Both directions closed
    Closed,
}

/// Independent read/write close flags
#[derive(Debug, Clone)]
pub struct CloseState {
    state: ConnectionState,
    released: bool,
}

impl CloseState {
    /// Create an open state
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Open,
            released: false,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the read side is closed
    pub fn is_read_closed(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::ReadClosed | ConnectionState::Closed
        )
    }

    /// Check if the write side is closed
    pub fn is_write_closed(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::WriteClosed | ConnectionState::Closed
        )
    }

    /// Check if both sides are closed
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Close the read side.
    ///
    /// Returns true exactly once: on the call that completes the full
    /// close and has not been released yet.
    pub fn close_read(&mut self) -> bool {
        self.state = match self.state {
            ConnectionState::Open => ConnectionState::ReadClosed,
            ConnectionState::WriteClosed => ConnectionState::Closed,
            s => s,
        };
        self.take_release()
    }

    /// Close the write side. Same return contract as [`close_read`](Self::close_read).
    pub fn close_write(&mut self) -> bool {
        self.state = match self.state {
            ConnectionState::Open => ConnectionState::WriteClosed,
            ConnectionState::ReadClosed => ConnectionState::Closed,
            s => s,
        };
        self.take_release()
    }

    fn take_release(&mut self) -> bool {
        if self.state == ConnectionState::Closed && !self.released {
            self.released = true;
            true
        } else {
            false
        }
    }
}

impl Default for CloseState {
    fn default() -> Self {
        Self::new()
    }
}
