//! Logical streams
//!
//! [`MuxStream`] is the application end, [`StreamEntry`] the driver's
//! bookkeeping for the same stream. Send-window credit is shared between
//! them so a writer blocks on the window itself rather than on a queue.

use super::MAX_DATA_FRAME;
use crate::transport::{HalfCloseMode, StreamConn};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Closed by this side
    ClosedLocal,
    /// Closed by the peer
    ClosedRemote,
    /// Torn down by a protocol error or session loss
    Reset,
}

/// Event delivered from the driver to a stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Close,
    Reset(String),
}

/// Command sent from streams and the session handle to the driver
pub(crate) enum Command {
    Open { entry: StreamEntry },
    Data { id: u32, data: Bytes },
    WindowUpdate { id: u32, increment: u32 },
    Close { id: u32 },
}

struct Window {
    credit: u32,
    state: StreamState,
    writer: Option<Waker>,
}

/// State shared between a stream and the driver
pub(crate) struct StreamShared {
    window: Mutex<Window>,
}

impl StreamShared {
    fn new(credit: u32) -> Self {
        Self {
            window: Mutex::new(Window {
                credit,
                state: StreamState::Open,
                writer: None,
            }),
        }
    }

    fn state(&self) -> StreamState {
        self.window.lock().state
    }

    fn set_state(&self, state: StreamState) {
        let mut window = self.window.lock();
        if window.state == StreamState::Open {
            window.state = state;
        }
        if let Some(waker) = window.writer.take() {
            waker.wake();
        }
    }

    fn grant(&self, increment: u32) {
        let mut window = self.window.lock();
        window.credit = window.credit.saturating_add(increment);
        if let Some(waker) = window.writer.take() {
            waker.wake();
        }
    }
}

/// Driver-side record of one stream
pub(crate) struct StreamEntry {
    id: u32,
    destination: String,
    recv_window: u32,
    events: mpsc::UnboundedSender<StreamEvent>,
    shared: Arc<StreamShared>,
}

impl StreamEntry {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn destination(&self) -> &str {
        &self.destination
    }

    /// Deliver data from the peer, enforcing the receive window
    pub(crate) fn push_data(&mut self, data: Bytes) -> Result<(), super::MuxError> {
        let len = data.len() as u32;
        if len > self.recv_window {
            return Err(super::MuxError::FlowControl(self.id));
        }
        self.recv_window -= len;
        let _ = self.events.send(StreamEvent::Data(data));
        Ok(())
    }

    /// The application consumed `increment` bytes
    pub(crate) fn reopen_window(&mut self, increment: u32) {
        self.recv_window = self.recv_window.saturating_add(increment);
    }

    /// The peer granted more send credit
    pub(crate) fn grant(&self, increment: u32) {
        self.shared.grant(increment);
    }

    pub(crate) fn close_remote(&self) {
        self.shared.set_state(StreamState::ClosedRemote);
        let _ = self.events.send(StreamEvent::Close);
    }

    pub(crate) fn reset(&self, reason: &str) {
        self.shared.set_state(StreamState::Reset);
        let _ = self.events.send(StreamEvent::Reset(reason.to_string()));
    }
}

/// A logical stream within a session.
///
/// Every close operation closes the whole stream: the frame protocol has
/// a single close signal per stream.
pub struct MuxStream {
    id: u32,
    destination: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    read_buf: Bytes,
    read_eof: bool,
    unacked: u32,
    ack_threshold: u32,
    write_tx: PollSender<Command>,
    ack_tx: PollSender<Command>,
    close_tx: mpsc::Sender<Command>,
    shared: Arc<StreamShared>,
    closed: bool,
}

impl MuxStream {
    /// Create a stream and the driver's entry for it
    pub(crate) fn pair(
        id: u32,
        destination: String,
        window_size: u32,
        cmd_tx: &mpsc::Sender<Command>,
    ) -> (Self, StreamEntry) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(window_size));

        let stream = Self {
            id,
            destination: destination.clone(),
            events,
            read_buf: Bytes::new(),
            read_eof: false,
            unacked: 0,
            ack_threshold: window_size / 2,
            write_tx: PollSender::new(cmd_tx.clone()),
            ack_tx: PollSender::new(cmd_tx.clone()),
            close_tx: cmd_tx.clone(),
            shared: shared.clone(),
            closed: false,
        };
        let entry = StreamEntry {
            id,
            destination,
            recv_window: window_size,
            events: event_tx,
            shared,
        };
        (stream, entry)
    }

    /// Stream id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Destination carried by the stream open frame
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    fn close_now(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.read_eof = true;
        self.shared.set_state(StreamState::ClosedLocal);

        let cmd = Command::Close { id: self.id };
        if let Err(mpsc::error::TrySendError::Full(cmd)) = self.close_tx.try_send(cmd) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let tx = self.close_tx.clone();
                handle.spawn(async move {
                    let _ = tx.send(cmd).await;
                });
            }
        }
    }

    fn poll_ack(&mut self, cx: &mut Context<'_>) {
        if self.unacked < self.ack_threshold || self.closed {
            return;
        }
        match self.ack_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let cmd = Command::WindowUpdate {
                    id: self.id,
                    increment: self.unacked,
                };
                if self.ack_tx.send_item(cmd).is_ok() {
                    self.unacked = 0;
                }
            }
            Poll::Ready(Err(_)) => self.unacked = 0,
            Poll::Pending => {}
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                this.unacked = this.unacked.saturating_add(n as u32);
                this.poll_ack(cx);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            this.poll_ack(cx);
            match ready!(this.events.poll_recv(cx)) {
                Some(StreamEvent::Data(data)) => this.read_buf = data,
                Some(StreamEvent::Close) | None => this.read_eof = true,
                Some(StreamEvent::Reset(reason)) => {
                    this.read_eof = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        reason,
                    )));
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = {
            let mut window = this.shared.window.lock();
            match window.state {
                StreamState::Open => {}
                StreamState::Reset => return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
                _ => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            }
            if window.credit == 0 {
                window.writer = Some(cx.waker().clone());
                return Poll::Pending;
            }
            buf.len().min(window.credit as usize).min(MAX_DATA_FRAME)
        };

        ready!(this.write_tx.poll_reserve(cx))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        // Credit only grows while we were waiting for the channel
        this.shared.window.lock().credit -= n as u32;
        this.write_tx
            .send_item(Command::Data {
                id: this.id,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        // Queue the close behind any data already handed to the driver
        if ready!(this.write_tx.poll_reserve(cx)).is_ok() {
            let _ = this.write_tx.send_item(Command::Close { id: this.id });
        }
        this.closed = true;
        this.read_eof = true;
        this.shared.set_state(StreamState::ClosedLocal);
        Poll::Ready(Ok(()))
    }
}

impl StreamConn for MuxStream {
    fn half_close_mode(&self) -> HalfCloseMode {
        HalfCloseMode::FullClose
    }

    fn close_read(&mut self) -> io::Result<()> {
        self.close_now();
        Ok(())
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close_now();
    }
}
