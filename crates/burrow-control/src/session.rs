//! Per-agent session state

use crate::error::ControlError;
use crate::pending_work::PendingWork;
use burrow_mux::{Multiplexer, MuxStream};
use burrow_proto::{AgentMetadata, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Last-seen tracking for the liveness check
#[derive(Debug)]
pub struct HeartbeatClock {
    last_seen: Mutex<Instant>,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle() > timeout
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One authenticated agent connection
pub struct Session {
    id: String,
    run_id: String,
    metadata: AgentMetadata,
    peer_addr: String,
    connected_at: DateTime<Utc>,
    mux: Multiplexer,
    /// Messages for the control loop to write on stream 0
    outbound: mpsc::Sender<Message>,
    state: Mutex<SessionState>,
    clock: HeartbeatClock,
    proxies: Mutex<BTreeSet<String>>,
    pool: Mutex<VecDeque<MuxStream>>,
    pool_count: usize,
    pending: PendingWork,
    shutdown: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        run_id: String,
        metadata: AgentMetadata,
        peer_addr: String,
        mux: Multiplexer,
        outbound: mpsc::Sender<Message>,
        pool_count: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            metadata,
            peer_addr,
            connected_at: Utc::now(),
            mux,
            outbound,
            state: Mutex::new(SessionState::Authenticating),
            clock: HeartbeatClock::new(),
            proxies: Mutex::new(BTreeSet::new()),
            pool: Mutex::new(VecDeque::new()),
            pool_count,
            pending: PendingWork::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn clock(&self) -> &HeartbeatClock {
        &self.clock
    }

    pub(crate) fn pending(&self) -> &PendingWork {
        &self.pending
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active && !self.mux.is_closed()
    }

    /// Move to `next` if the lifecycle allows it
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Cancelled once the session starts closing
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue a control message for the agent
    pub async fn send(&self, msg: Message) -> Result<(), ControlError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ControlError::Transport("control loop has stopped".to_string()))
    }

    pub(crate) fn track_proxy(&self, name: &str) {
        lock(&self.proxies).insert(name.to_string());
    }

    pub(crate) fn untrack_proxy(&self, name: &str) -> bool {
        lock(&self.proxies).remove(name)
    }

    pub fn proxies(&self) -> Vec<String> {
        lock(&self.proxies).iter().cloned().collect()
    }

    pub(crate) fn take_proxies(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.proxies)).into_iter().collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pool_count
    }

    /// Take an idle pooled work stream
    pub(crate) fn take_pooled(&self) -> Option<MuxStream> {
        lock(&self.pool).pop_front()
    }

    /// Park an unsolicited work stream; dropped (reset) when the pool is full
    pub(crate) fn offer_pooled(&self, stream: MuxStream) -> bool {
        let mut pool = lock(&self.pool);
        if pool.len() < self.pool_count {
            pool.push_back(stream);
            true
        } else {
            false
        }
    }

    pub fn pooled(&self) -> usize {
        lock(&self.pool).len()
    }

    /// Release everything the session holds on the transport
    pub(crate) fn abort_streams(&self) -> usize {
        let failed = self.pending.fail_all();
        lock(&self.pool).clear();
        self.shutdown.cancel();
        failed
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            run_id: self.run_id.clone(),
            hostname: self.metadata.hostname.clone(),
            platform: self.metadata.platform.clone(),
            version: self.metadata.version.clone(),
            peer_addr: self.peer_addr.clone(),
            state: self.state(),
            proxies: self.proxies(),
            pooled_work_conns: self.pooled(),
            open_streams: self.mux.stream_count(),
            connected_at: self.connected_at,
            idle_ms: self.clock.idle().as_millis() as u64,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Session summary, for snapshots
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub run_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub peer_addr: String,
    pub state: SessionState,
    pub proxies: Vec<String>,
    pub pooled_work_conns: usize,
    pub open_streams: usize,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
