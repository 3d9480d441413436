//! Physical session: one connection, many streams

use super::frame::{Frame, FrameType, MAX_STREAM_ID};
use super::stream::{Command, MuxStream, StreamEntry};
use super::{MuxConfig, MuxError};
use crate::transport::BoxConn;
use bytes::BytesMut;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Capacity of the command channel shared by all streams of a session
const COMMAND_CAPACITY: usize = 256;

/// Capacity of the reader-to-driver frame channel
const FRAME_CAPACITY: usize = 256;

/// Missed keepalive intervals before the session is considered dead
const KEEPALIVE_MISSES: u32 = 3;

struct SessionShared {
    closed: AtomicBool,
    active: AtomicUsize,
    next_id: AtomicU32,
}

/// Handle to a multiplexed session
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<SessionShared>,
    config: MuxConfig,
    cancel: CancellationToken,
}

/// Streams opened by the peer
pub struct Incoming {
    rx: mpsc::Receiver<MuxStream>,
}

impl Incoming {
    /// Wait for the next stream; `None` once the session is gone
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await
    }
}

impl Session {
    /// Start the client side: streams opened here get odd ids
    pub fn client(conn: BoxConn, config: MuxConfig) -> Self {
        let (session, _) = Self::start(conn, config, true);
        session
    }

    /// Start the server side: accepts streams opened by the client
    pub fn server(conn: BoxConn, config: MuxConfig) -> (Self, Incoming) {
        let (session, rx) = Self::start(conn, config, false);
        (session, Incoming { rx })
    }

    fn start(conn: BoxConn, config: MuxConfig, is_client: bool) -> (Self, mpsc::Receiver<MuxStream>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.max_streams.clamp(1, COMMAND_CAPACITY));
        let cancel = CancellationToken::new();

        let shared = Arc::new(SessionShared {
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            // Odd for client, even for server
            next_id: AtomicU32::new(if is_client { 1 } else { 2 }),
        });

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(read_frames(reader, frame_tx, cancel.clone()));

        let driver = Driver {
            writer,
            streams: HashMap::new(),
            cmd_tx: cmd_tx.downgrade(),
            cmd_rx,
            frame_rx,
            incoming_tx,
            shared: shared.clone(),
            config: config.clone(),
            is_client,
            cancel: cancel.clone(),
            last_rx: Instant::now(),
        };
        tokio::spawn(driver.run());

        (
            Self {
                cmd_tx,
                shared,
                config,
                cancel,
            },
            incoming_rx,
        )
    }

    /// Open a new stream towards `destination`
    pub async fn open_stream(&self, destination: &str) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let previous = self.shared.active.fetch_add(1, Ordering::AcqRel);
        if previous >= self.config.max_streams {
            self.shared.active.fetch_sub(1, Ordering::AcqRel);
            return Err(MuxError::TooManyStreams(self.config.max_streams));
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::AcqRel);
        if id > MAX_STREAM_ID {
            self.shared.active.fetch_sub(1, Ordering::AcqRel);
            return Err(MuxError::StreamIdsExhausted);
        }

        let (stream, entry) =
            MuxStream::pair(id, destination.to_string(), self.config.window_size, &self.cmd_tx);

        if self.cmd_tx.send(Command::Open { entry }).await.is_err() {
            self.shared.active.fetch_sub(1, Ordering::AcqRel);
            return Err(MuxError::SessionClosed);
        }

        trace!("mux: opened stream {} to {}", id, destination);
        Ok(stream)
    }

    /// Check if the session has shut down
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Number of open streams
    pub fn active_streams(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether a new stream could be opened right now
    pub fn can_open(&self) -> bool {
        !self.is_closed()
            && !self.ids_exhausted()
            && self.active_streams() < self.config.max_streams
    }

    /// Whether this session will never open another stream
    pub fn ids_exhausted(&self) -> bool {
        self.shared.next_id.load(Ordering::Acquire) > MAX_STREAM_ID
    }

    /// Shut the session down, resetting every stream
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Reader task: decode frames and hand them to the driver
async fn read_frames(
    mut reader: ReadHalf<BoxConn>,
    frames: mpsc::Sender<Result<Frame, MuxError>>,
    cancel: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);

    loop {
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    if frames.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frames.send(Err(e)).await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    trace!("mux: physical connection closed by peer");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = frames.send(Err(MuxError::Io(e))).await;
                    return;
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Driver task: owns the write half and the stream table
struct Driver {
    writer: WriteHalf<BoxConn>,
    streams: HashMap<u32, StreamEntry>,
    cmd_tx: mpsc::WeakSender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    frame_rx: mpsc::Receiver<Result<Frame, MuxError>>,
    incoming_tx: mpsc::Sender<MuxStream>,
    shared: Arc<SessionShared>,
    config: MuxConfig,
    is_client: bool,
    cancel: CancellationToken,
    last_rx: Instant,
}

impl Driver {
    async fn run(mut self) {
        let mut keepalive = (self.config.keepalive_interval > 0).then(|| {
            let period = Duration::from_secs(self.config.keepalive_interval);
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        let reason = loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.write_frame(Frame::go_away()).await;
                    break "session closed locally".to_string();
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break "all handles dropped".to_string(),
                },
                frame = self.frame_rx.recv() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(e)) => Err(e),
                    None => break "physical connection closed".to_string(),
                },
                _ = tick(&mut keepalive) => self.keepalive().await,
            };

            if let Err(e) = step {
                break e.to_string();
            }
        };

        debug!("mux session ended: {}", reason);
        self.shutdown(&reason).await;
    }

    async fn shutdown(&mut self, reason: &str) {
        self.shared.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        for (_, entry) in self.streams.drain() {
            entry.reset(reason);
        }
        // Streams whose open never reached the wire
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Command::Open { entry } = cmd {
                entry.reset(reason);
            }
        }
        self.shared.active.store(0, Ordering::Release);

        let _ = self.writer.shutdown().await;
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        trace!(
            "mux: send {:?} stream={} len={}",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        self.writer.write_all(&frame.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn remove_stream(&mut self, id: u32) -> Option<StreamEntry> {
        let entry = self.streams.remove(&id)?;
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), MuxError> {
        match cmd {
            Command::Open { entry } => {
                let frame = Frame::stream_open(entry.id(), entry.destination());
                self.streams.insert(entry.id(), entry);
                self.write_frame(frame).await
            }
            Command::Data { id, data } => {
                if !self.streams.contains_key(&id) {
                    trace!("mux: dropping data for closed stream {}", id);
                    return Ok(());
                }
                let mut frame = Frame::data(id, data);
                if let Some(padding) = &self.config.padding {
                    let len = padding.calculate_padding(frame.payload.len());
                    frame = frame.with_padding(len);
                }
                self.write_frame(frame).await
            }
            Command::WindowUpdate { id, increment } => match self.streams.get_mut(&id) {
                Some(entry) => {
                    entry.reopen_window(increment);
                    self.write_frame(Frame::window_update(id, increment)).await
                }
                None => Ok(()),
            },
            Command::Close { id } => {
                if self.remove_stream(id).is_some() {
                    self.write_frame(Frame::stream_close(id)).await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        self.last_rx = Instant::now();
        trace!(
            "mux: recv {:?} stream={} len={}",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Data => {
                let id = frame.stream_id;
                let Some(entry) = self.streams.get_mut(&id) else {
                    trace!("mux: data for unknown stream {}", id);
                    return Ok(());
                };
                if let Err(e) = entry.push_data(frame.payload) {
                    warn!("mux: resetting stream {}: {}", id, e);
                    if let Some(entry) = self.remove_stream(id) {
                        entry.reset(&e.to_string());
                    }
                    self.write_frame(Frame::stream_close(id)).await?;
                }
                Ok(())
            }
            FrameType::StreamOpen => self.accept_stream(frame).await,
            FrameType::StreamClose => {
                if let Some(entry) = self.remove_stream(frame.stream_id) {
                    entry.close_remote();
                }
                Ok(())
            }
            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                if let Some(entry) = self.streams.get(&frame.stream_id) {
                    entry.grant(increment);
                }
                Ok(())
            }
            FrameType::Ping => self.write_frame(Frame::pong(frame.payload)).await,
            FrameType::Pong | FrameType::Padding => Ok(()),
            FrameType::GoAway => Err(MuxError::SessionClosed),
        }
    }

    async fn accept_stream(&mut self, frame: Frame) -> Result<(), MuxError> {
        let id = frame.stream_id;

        // Clients only open streams; peers open odd ids
        if self.is_client || id % 2 == 0 || self.streams.contains_key(&id) {
            warn!("mux: rejecting stream open for id {}", id);
            return self.write_frame(Frame::stream_close(id)).await;
        }

        let destination = frame.destination()?;
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return Err(MuxError::SessionClosed);
        };

        if self.shared.active.load(Ordering::Acquire) >= self.config.max_streams {
            warn!("mux: stream limit reached, refusing {}", destination);
            return self.write_frame(Frame::stream_close(id)).await;
        }

        let (stream, entry) =
            MuxStream::pair(id, destination.clone(), self.config.window_size, &cmd_tx);
        self.streams.insert(id, entry);
        self.shared.active.fetch_add(1, Ordering::AcqRel);

        if self.incoming_tx.try_send(stream).is_err() {
            // Dropping the stream queues its close
            warn!("mux: accept queue full, refusing {}", destination);
        } else {
            trace!("mux: accepted stream {} to {}", id, destination);
        }
        Ok(())
    }

    async fn keepalive(&mut self) -> Result<(), MuxError> {
        let period = Duration::from_secs(self.config.keepalive_interval);
        if self.last_rx.elapsed() > period * KEEPALIVE_MISSES {
            return Err(MuxError::KeepaliveTimeout);
        }
        let nonce: u64 = rand::thread_rng().gen();
        self.write_frame(Frame::ping(nonce)).await?;

        // Fill idle periods with a padding frame when shaping is on
        if let Some(padding) = &self.config.padding {
            let len = padding.calculate_padding(0);
            if len > 0 {
                self.write_frame(Frame::padding(len)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplex::MAX_DATA_FRAME;
    use crate::transport::PlainConn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair(config: MuxConfig) -> (Session, Session, Incoming) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = Session::client(Box::new(PlainConn::new(a)), config.clone());
        let (server, incoming) = Session::server(Box::new(PlainConn::new(b)), config);
        (client, server, incoming)
    }

    #[tokio::test]
    async fn test_open_and_exchange() {
        let (client, _server, mut incoming) = session_pair(MuxConfig::default());

        let mut stream = client.open_stream("example.com:443").await.unwrap();
        assert_eq!(stream.id(), 1);
        stream.write_all(b"ping").await.unwrap();

        let mut accepted = incoming.accept().await.unwrap();
        assert_eq!(accepted.destination(), "example.com:443");
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let second = client.open_stream("example.org:80").await.unwrap();
        assert_eq!(second.id(), 3);
        assert_eq!(client.active_streams(), 2);
    }

    #[tokio::test]
    async fn test_close_propagates_as_eof() {
        let (client, _server, mut incoming) = session_pair(MuxConfig::default());

        let mut stream = client.open_stream("example.com:443").await.unwrap();
        stream.write_all(b"last words").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut accepted = incoming.accept().await.unwrap();
        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"last words");
    }

    #[tokio::test]
    async fn test_flow_control_large_transfer() {
        let config = MuxConfig {
            window_size: MAX_DATA_FRAME as u32 * 2,
            ..MuxConfig::default()
        };
        let (client, _server, mut incoming) = session_pair(config);

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();

        let mut stream = client.open_stream("bulk:1").await.unwrap();
        let writer = tokio::spawn(async move {
            stream.write_all(&payload).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut accepted = incoming.accept().await.unwrap();
        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        assert_eq!(received.len(), expected.len());
        assert!(received == expected);
    }

    #[tokio::test]
    async fn test_stream_limit() {
        let config = MuxConfig {
            max_streams: 1,
            ..MuxConfig::default()
        };
        let (client, _server, _incoming) = session_pair(config);

        let first = client.open_stream("a:1").await.unwrap();
        assert!(!client.can_open());
        assert!(matches!(
            client.open_stream("b:1").await,
            Err(MuxError::TooManyStreams(1))
        ));
        drop(first);
    }

    #[tokio::test]
    async fn test_peer_loss_resets_streams() {
        let (a, b) = tokio::io::duplex(1024);
        let client = Session::client(Box::new(PlainConn::new(a)), MuxConfig::default());
        let mut stream = client.open_stream("example.com:443").await.unwrap();

        drop(b);

        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream("example.com:443").await,
            Err(MuxError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_padding_is_transparent() {
        let config = MuxConfig {
            padding: Some(crate::multiplex::PaddingConfig::default()),
            ..MuxConfig::default()
        };
        let (client, _server, mut incoming) = session_pair(config);

        let mut stream = client.open_stream("example.com:443").await.unwrap();
        stream.write_all(b"padded").await.unwrap();

        let mut accepted = incoming.accept().await.unwrap();
        let mut buf = [0u8; 6];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"padded");
    }
}
