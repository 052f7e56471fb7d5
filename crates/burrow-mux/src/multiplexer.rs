//! Multiplexed connection: reader and writer tasks plus the stream table

use crate::stream::{MuxStream, StreamState};
use crate::{lock, MuxError};
use burrow_proto::{Frame, FrameCodec, FrameType, StreamId, CONTROL_STREAM_ID, DEFAULT_WINDOW_SIZE};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// GoAway reason codes
const GO_AWAY_NORMAL: u32 = 0;

/// Which end of the connection we are; decides stream id parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream ids
    Client,
    /// Opens even stream ids
    Server,
}

impl Role {
    fn first_local_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn is_peer_id(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

/// Multiplexer tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Per-stream receive window; both ends must agree
    pub window_size: u32,
    /// Peer-opened streams waiting for `accept_stream` before new ones are reset
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            accept_backlog: 256,
        }
    }
}

/// State shared by the handle, every stream and both IO tasks
pub(crate) struct MuxShared {
    role: Role,
    pub(crate) window_size: u32,
    streams: Mutex<HashMap<StreamId, Arc<StreamState>>>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    accept_tx: Mutex<Option<mpsc::Sender<MuxStream>>>,
    next_stream_id: AtomicU32,
    last_peer_id: AtomicU32,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_ping: AtomicU64,
    go_away: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    writer_done: CancellationToken,
}

impl MuxShared {
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        self.frame_tx
            .send(frame)
            .map_err(|_| MuxError::TransportClosed)
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
    }

    fn get_stream(&self, id: StreamId) -> Option<Arc<StreamState>> {
        lock(&self.streams).get(&id).cloned()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail every stream and stop both IO tasks
    fn teardown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(role = ?self.role, "Multiplexer closing: {}", reason);

        lock(&self.accept_tx).take();
        let streams: Vec<Arc<StreamState>> =
            lock(&self.streams).drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.transport_closed();
        }
        lock(&self.pings).clear();
        self.shutdown.cancel();
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        trace!(
            stream_id = frame.stream_id,
            frame_type = ?frame.frame_type,
            len = frame.payload.len(),
            "Received frame"
        );

        match frame.frame_type {
            FrameType::Data => match self.get_stream(frame.stream_id) {
                Some(stream) => stream.push_data(frame.payload)?,
                None => trace!("Dropping data for unknown stream {}", frame.stream_id),
            },
            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                if let Some(stream) = self.get_stream(frame.stream_id) {
                    stream.add_send_credit(increment);
                }
            }
            FrameType::Open => self.accept_remote(frame.stream_id)?,
            FrameType::Close => {
                if frame.flags.has_rst() {
                    if let Some(stream) = lock(&self.streams).remove(&frame.stream_id) {
                        debug!("Stream {} reset by peer", frame.stream_id);
                        stream.remote_reset();
                    }
                } else if let Some(stream) = self.get_stream(frame.stream_id) {
                    if stream.remote_fin() {
                        self.remove_stream(frame.stream_id);
                    }
                }
            }
            FrameType::Ping => {
                let value = frame.ping_value()?;
                if frame.flags.has_ack() {
                    if let Some(tx) = lock(&self.pings).remove(&value) {
                        let _ = tx.send(());
                    }
                } else {
                    self.send_frame(Frame::pong(value))?;
                }
            }
            FrameType::GoAway => {
                let code = frame.go_away_code()?;
                debug!(code, "Peer is going away");
                self.go_away.store(true, Ordering::SeqCst);
            }
        }

        Ok(())
    }

    fn accept_remote(self: &Arc<Self>, id: StreamId) -> Result<(), MuxError> {
        if id == CONTROL_STREAM_ID || !self.role.is_peer_id(id) {
            return Err(MuxError::Protocol(format!(
                "peer opened stream {} with wrong parity",
                id
            )));
        }
        if id <= self.last_peer_id.load(Ordering::SeqCst) {
            return Err(MuxError::Protocol(format!("peer reused stream id {}", id)));
        }
        self.last_peer_id.store(id, Ordering::SeqCst);

        let state = Arc::new(StreamState::new(id, self.window_size));
        lock(&self.streams).insert(id, state.clone());
        let stream = MuxStream::new(id, state, self.clone());

        let accept_tx = lock(&self.accept_tx).clone();
        match accept_tx {
            Some(tx) => {
                if tx.try_send(stream).is_err() {
                    // Dropping the rejected stream resets it
                    warn!("Accept backlog full, resetting stream {}", id);
                }
            }
            None => drop(stream),
        }
        Ok(())
    }
}

async fn reader_loop<R>(shared: Arc<MuxShared>, read_half: R)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(read_half, FrameCodec);

    let result: Result<(), MuxError> = loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break Ok(()),
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                if let Err(e) = shared.handle_frame(frame) {
                    break Err(e);
                }
            }
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        }
    };

    match result {
        Ok(()) => shared.teardown("transport closed"),
        Err(e) => {
            warn!("Multiplexer reader failed: {}", e);
            shared.teardown(&e.to_string());
        }
    }
}

async fn writer_loop<W>(
    shared: Arc<MuxShared>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    write_half: W,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(write_half, FrameCodec);

    let result = async {
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shared.shutdown.cancelled() => break,
            };

            // Batch whatever is already queued into one flush
            let mut going_away = frame.frame_type == FrameType::GoAway;
            sink.feed(frame).await?;
            while let Ok(frame) = rx.try_recv() {
                going_away |= frame.frame_type == FrameType::GoAway;
                sink.feed(frame).await?;
            }
            sink.flush().await?;

            if going_away {
                break;
            }
        }
        sink.close().await?;
        Ok::<(), MuxError>(())
    }
    .await;

    shared.writer_done.cancel();
    if let Err(e) = result {
        debug!("Multiplexer writer failed: {}", e);
        shared.teardown(&e.to_string());
    }
}

/// Multiplexed connection handle
///
/// Cheap to clone; the connection is torn down when the last handle is dropped
/// or `close` is called.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxHandle>,
}

struct MuxHandle {
    shared: Arc<MuxShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    control: Mutex<Option<MuxStream>>,
}

impl Drop for MuxHandle {
    fn drop(&mut self) {
        self.shared.teardown("multiplexer dropped");
    }
}

impl Multiplexer {
    /// Multiplexer for the dialing side (odd stream ids)
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, Role::Client, MuxConfig::default())
    }

    /// Multiplexer for the accepting side (even stream ids)
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, Role::Server, MuxConfig::default())
    }

    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(MuxShared {
            role,
            window_size: config.window_size,
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            accept_tx: Mutex::new(Some(accept_tx)),
            next_stream_id: AtomicU32::new(role.first_local_id()),
            last_peer_id: AtomicU32::new(0),
            pings: Mutex::new(HashMap::new()),
            next_ping: AtomicU64::new(1),
            go_away: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            writer_done: CancellationToken::new(),
        });

        let control_state = Arc::new(StreamState::new(CONTROL_STREAM_ID, config.window_size));
        lock(&shared.streams).insert(CONTROL_STREAM_ID, control_state.clone());
        let control = MuxStream::new(CONTROL_STREAM_ID, control_state, shared.clone());

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(reader_loop(shared.clone(), read_half));
        tokio::spawn(writer_loop(shared.clone(), frame_rx, write_half));

        debug!(role = ?role, "Multiplexer started");

        Self {
            inner: Arc::new(MuxHandle {
                shared,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                control: Mutex::new(Some(control)),
            }),
        }
    }

    /// Take the control stream (stream 0); `None` after the first call
    pub fn control_stream(&self) -> Option<MuxStream> {
        lock(&self.inner.control).take()
    }

    /// Open a new outbound stream
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let shared = &self.inner.shared;
        if shared.is_closed() || shared.go_away.load(Ordering::SeqCst) {
            return Err(MuxError::TransportClosed);
        }

        let id = shared
            .next_stream_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(2))
            .map_err(|_| MuxError::StreamIdsExhausted)?;

        let state = Arc::new(StreamState::new(id, shared.window_size));
        lock(&shared.streams).insert(id, state.clone());
        if shared.is_closed() {
            shared.remove_stream(id);
            return Err(MuxError::TransportClosed);
        }

        shared.send_frame(Frame::open(id))?;
        trace!("Opened stream {}", id);
        Ok(MuxStream::new(id, state, shared.clone()))
    }

    /// Wait for the peer to open a stream; `None` once the connection is gone
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut rx = self.inner.accept_rx.lock().await;
        rx.recv().await
    }

    /// Measure round-trip time over the connection
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        let shared = &self.inner.shared;
        let value = shared.next_ping.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&shared.pings).insert(value, tx);
        if shared.is_closed() {
            lock(&shared.pings).remove(&value);
            return Err(MuxError::TransportClosed);
        }

        let start = Instant::now();
        shared.send_frame(Frame::ping(value))?;
        rx.await.map_err(|_| MuxError::TransportClosed)?;
        Ok(start.elapsed())
    }

    /// Announce GoAway, flush pending frames and tear the connection down
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return;
        }
        if shared.send_frame(Frame::go_away(GO_AWAY_NORMAL)).is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(1), shared.writer_done.cancelled())
                .await;
        }
        shared.teardown("closed locally");
    }

    /// Resolves once the connection has been torn down
    pub async fn closed(&self) {
        self.inner.shared.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    pub fn role(&self) -> Role {
        self.inner.shared.role
    }

    /// Number of live streams, the control stream included
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.shared.streams).len()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.inner.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}
