//! Control plane: agent sessions, proxy lifecycle and work connections

use crate::config::ServerConfig;
use crate::error::ControlError;
use crate::events::{ServerSnapshot, SessionEvent};
use crate::registry::{Binding, ProxyRegistry};
use crate::session::{Session, SessionState};
use crate::task_tracker::TaskTracker;
use burrow_auth::{Credentials, TokenVerifier};
use burrow_mux::{Multiplexer, MuxStream};
use burrow_proto::{
    read_message, write_message, AgentMetadata, Message, MessageCodec, ProxyConfig,
    PROTOCOL_VERSION,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Binds the public listener for a tcp proxy and returns its accept task
pub type TcpProxySpawner = Arc<
    dyn Fn(
            Arc<ControlHandler>,
            String,
            u16,
        ) -> Pin<Box<dyn Future<Output = Result<JoinHandle<()>, String>> + Send>>
        + Send
        + Sync,
>;

type ControlFramed = Framed<MuxStream, MessageCodec>;

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Decoded `Login`
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub version: u32,
    pub run_id: String,
    pub privilege_key: String,
    pub timestamp: i64,
    pub pool_count: u32,
    pub metadata: AgentMetadata,
}

impl LoginRequest {
    pub fn from_message(msg: Message) -> Result<Self, Message> {
        match msg {
            Message::Login {
                version,
                run_id,
                privilege_key,
                timestamp,
                pool_count,
                metadata,
            } => Ok(Self {
                version,
                run_id,
                privilege_key,
                timestamp,
                pool_count,
                metadata,
            }),
            other => Err(other),
        }
    }
}

/// A work stream handed to an inbound connection, `StartWorkConn` already sent
#[derive(Debug)]
pub struct WorkConn {
    pub stream: MuxStream,
    pub config: ProxyConfig,
    pub session_id: String,
}

/// Owns every agent session and funnels proxy changes into the registry
pub struct ControlHandler {
    config: Arc<ServerConfig>,
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<ProxyRegistry>,
    sessions: DashMap<String, Arc<Session>>,
    /// run id -> session id, for takeover on reconnect
    run_ids: DashMap<String, String>,
    events: broadcast::Sender<SessionEvent>,
    tcp_spawner: Option<TcpProxySpawner>,
    listeners: TaskTracker,
}

impl ControlHandler {
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let registry = Arc::new(ProxyRegistry::from_config(&config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: Arc::new(config),
            verifier,
            registry,
            sessions: DashMap::new(),
            run_ids: DashMap::new(),
            events,
            tcp_spawner: None,
            listeners: TaskTracker::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<ProxyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_tcp_proxy_spawner(mut self, spawner: TcpProxySpawner) -> Self {
        self.tcp_spawner = Some(spawner);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn session_by_run_id(&self, run_id: &str) -> Option<Arc<Session>> {
        let session_id = self.run_ids.get(run_id)?.value().clone();
        self.session(&session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn active_session(&self, session_id: &str) -> Result<Arc<Session>, ControlError> {
        self.session(session_id)
            .filter(|s| s.is_active())
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))
    }

    /// Public address reported to the agent for a binding
    pub fn remote_addr(&self, binding: &Binding) -> String {
        match binding {
            Binding::Tcp { port } => self.config.tcp_remote_addr(*port),
            Binding::Http { domains, .. } => domains
                .iter()
                .map(|d| self.config.http_remote_addr(d))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Drive one agent connection from `Login` until the session ends
    pub async fn handle_connection<T>(self: Arc<Self>, io: T, peer_addr: String)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!(peer = %peer_addr, state = %SessionState::Connecting, "Agent connected");
        let mux = Multiplexer::server(io);
        let Some(control) = mux.control_stream() else {
            error!(peer = %peer_addr, "Control stream unavailable");
            return;
        };
        let mut framed = Framed::new(control, MessageCodec);

        debug!(peer = %peer_addr, state = %SessionState::Authenticating, "Waiting for login");
        let login = match tokio::time::timeout(self.config.login_timeout, framed.next()).await {
            Ok(Some(Ok(msg))) => match LoginRequest::from_message(msg) {
                Ok(login) => login,
                Err(other) => {
                    warn!(peer = %peer_addr, "Expected Login, got {}", other.kind());
                    mux.close().await;
                    return;
                }
            },
            Ok(Some(Err(e))) => {
                warn!(peer = %peer_addr, "Failed to read login: {}", e);
                mux.close().await;
                return;
            }
            Ok(None) => {
                debug!(peer = %peer_addr, "Agent disconnected before login");
                return;
            }
            Err(_) => {
                warn!(peer = %peer_addr, "Login timed out");
                mux.close().await;
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = match self
            .handle_login(login, mux.clone(), outbound_tx, peer_addr.clone())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer_addr, "Login rejected: {}", e);
                let resp = Message::LoginResp {
                    version: PROTOCOL_VERSION,
                    run_id: String::new(),
                    session_id: String::new(),
                    error: Some(e.to_string()),
                };
                let _ = framed.send(resp).await;
                mux.close().await;
                return;
            }
        };

        let resp = Message::LoginResp {
            version: PROTOCOL_VERSION,
            run_id: session.run_id().to_string(),
            session_id: session.id().to_string(),
            error: None,
        };
        if let Err(e) = framed.feed(resp).await {
            self.close_session(session.id(), &format!("login response failed: {}", e))
                .await;
            return;
        }
        // Ask for the idle pool straight away
        for _ in 0..session.pool_count() {
            if framed
                .feed(Message::NewWorkConn {
                    correlation_id: None,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        if let Err(e) = framed.flush().await {
            self.close_session(session.id(), &format!("control write failed: {}", e))
                .await;
            return;
        }

        tokio::spawn(self.clone().accept_work_streams(session.clone()));

        let reason = self.run_control_loop(&session, framed, outbound_rx).await;
        self.close_session(session.id(), &reason).await;
    }

    /// Authenticate a login and register its session
    ///
    /// A live session with the same run id is closed first.
    pub async fn handle_login(
        &self,
        login: LoginRequest,
        mux: Multiplexer,
        outbound: mpsc::Sender<Message>,
        peer_addr: String,
    ) -> Result<Arc<Session>, ControlError> {
        if login.version != PROTOCOL_VERSION {
            return Err(ControlError::Validation(format!(
                "unsupported protocol version {} (relay speaks {})",
                login.version, PROTOCOL_VERSION
            )));
        }

        let credentials = Credentials {
            run_id: login.run_id.clone(),
            privilege_key: login.privilege_key,
            timestamp: login.timestamp,
        };
        let auth = self.verifier.verify(&credentials).await?;

        let run_id = if login.run_id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            login.run_id
        };

        if let Some(old) = self.session_by_run_id(&run_id) {
            info!(
                run_id = %run_id,
                old_session = %old.id(),
                "Agent reconnected, replacing previous session"
            );
            self.close_session(old.id(), "replaced by a new login").await;
        }

        let pool_count = login.pool_count.min(self.config.max_pool_count) as usize;
        let session = Arc::new(Session::new(
            run_id.clone(),
            login.metadata,
            peer_addr.clone(),
            mux,
            outbound,
            pool_count,
        ));
        session.transition(SessionState::Active);

        self.sessions
            .insert(session.id().to_string(), session.clone());
        self.run_ids.insert(run_id.clone(), session.id().to_string());

        info!(
            session_id = %session.id(),
            run_id = %run_id,
            subject = %auth.subject,
            hostname = %session.metadata().hostname,
            pool_count,
            "Session established"
        );
        self.emit(SessionEvent::Connected {
            session_id: session.id().to_string(),
            run_id,
            peer_addr,
        });

        Ok(session)
    }

    /// Per-session loop: control messages in, queued messages out, liveness check
    async fn run_control_loop(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut framed: ControlFramed,
        mut outbound: mpsc::Receiver<Message>,
    ) -> String {
        let mut check = tokio::time::interval(self.config.heartbeat_check_interval);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = session.shutdown_token();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return "session closed".to_string();
                }
                _ = check.tick() => {
                    if session.clock().is_expired(self.config.heartbeat_timeout) {
                        warn!(
                            session_id = %session.id(),
                            idle_ms = session.clock().idle().as_millis() as u64,
                            "Heartbeat timeout"
                        );
                        return "heartbeat timeout".to_string();
                    }
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        return "control channel closed".to_string();
                    };
                    if let Err(e) = framed.send(msg).await {
                        return format!("control write failed: {}", e);
                    }
                }
                msg = framed.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            session.clock().touch();
                            if let ControlFlow::Break(reason) =
                                self.handle_message(session, msg, &mut framed).await
                            {
                                return reason;
                            }
                        }
                        Some(Err(e)) => return format!("control stream error: {}", e),
                        None => return "agent disconnected".to_string(),
                    }
                }
            }
        }
    }

    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        msg: Message,
        framed: &mut ControlFramed,
    ) -> ControlFlow<String> {
        match msg {
            Message::Ping { timestamp } => {
                if let Err(e) = self.heartbeat(session.id()) {
                    debug!("Heartbeat for closing session: {}", e);
                }
                if let Err(e) = framed.send(Message::Pong { timestamp }).await {
                    return ControlFlow::Break(format!("control write failed: {}", e));
                }
            }
            Message::Pong { .. } => {}
            Message::NewProxy { config } => {
                let name = config.name.clone();
                let resp = match self.add_proxy(session.id(), config).await {
                    Ok(binding) => Message::NewProxyResp {
                        name,
                        remote_addr: self.remote_addr(&binding),
                        error: None,
                    },
                    Err(e) => {
                        warn!(session_id = %session.id(), proxy = %name, "Proxy rejected: {}", e);
                        Message::NewProxyResp {
                            name,
                            remote_addr: String::new(),
                            error: Some(e.to_string()),
                        }
                    }
                };
                if let Err(e) = framed.send(resp).await {
                    return ControlFlow::Break(format!("control write failed: {}", e));
                }
            }
            Message::CloseProxy { name } => {
                if let Err(e) = self.remove_proxy(session.id(), &name) {
                    warn!(session_id = %session.id(), proxy = %name, "CloseProxy failed: {}", e);
                }
            }
            Message::Logout { reason } => {
                info!(session_id = %session.id(), "Agent logged out: {}", reason);
                return ControlFlow::Break(format!("logout: {}", reason));
            }
            other => {
                warn!(
                    session_id = %session.id(),
                    "Unexpected {} on control stream",
                    other.kind()
                );
            }
        }
        ControlFlow::Continue(())
    }

    /// Bind a proxy for an active session
    ///
    /// Inbound traffic is accepted as soon as this returns.
    pub async fn add_proxy(
        self: &Arc<Self>,
        session_id: &str,
        config: ProxyConfig,
    ) -> Result<Binding, ControlError> {
        let session = self.active_session(session_id)?;
        let name = config.name.clone();
        let binding = self.registry.add(config, session_id)?;

        if let (Binding::Tcp { port }, Some(spawner)) = (&binding, &self.tcp_spawner) {
            match spawner(self.clone(), name.clone(), *port).await {
                Ok(handle) => self.listeners.register(name.clone(), handle),
                Err(e) => {
                    self.registry.remove(&name);
                    return Err(ControlError::Conflict(format!(
                        "cannot listen on port {}: {}",
                        port, e
                    )));
                }
            }
        }

        session.track_proxy(&name);
        if !session.is_active() {
            // Lost a race with close_session, which may have unbound the proxy
            // before its listener was registered
            self.unbind(session_id, &name);
            let owner = self.registry.lookup(&name).map(|(_, owner)| owner);
            if owner.map_or(true, |owner| owner == session_id) {
                self.listeners.unregister(&name);
            }
            return Err(ControlError::SessionNotFound(session_id.to_string()));
        }

        let remote_addr = self.remote_addr(&binding);
        info!(session_id = %session_id, proxy = %name, remote_addr = %remote_addr, "Proxy bound");
        self.emit(SessionEvent::ProxyBound {
            session_id: session_id.to_string(),
            proxy: name,
            remote_addr,
        });
        Ok(binding)
    }

    /// Unbind a proxy owned by `session_id`; unknown names are a no-op
    pub fn remove_proxy(&self, session_id: &str, name: &str) -> Result<(), ControlError> {
        if self.registry.remove_owned(name, session_id)?.is_none() {
            debug!(session_id = %session_id, proxy = %name, "Proxy already removed");
            return Ok(());
        }
        self.listeners.unregister(name);
        if let Some(session) = self.session(session_id) {
            session.untrack_proxy(name);
        }
        info!(session_id = %session_id, proxy = %name, "Proxy removed");
        self.emit(SessionEvent::ProxyUnbound {
            session_id: session_id.to_string(),
            proxy: name.to_string(),
        });
        Ok(())
    }

    fn unbind(&self, session_id: &str, name: &str) {
        if let Ok(Some(_)) = self.registry.remove_owned(name, session_id) {
            self.listeners.unregister(name);
            self.emit(SessionEvent::ProxyUnbound {
                session_id: session_id.to_string(),
                proxy: name.to_string(),
            });
        }
    }

    pub fn heartbeat(&self, session_id: &str) -> Result<(), ControlError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))?;
        session.clock().touch();
        Ok(())
    }

    /// Obtain a work stream from the agent owning `session_id`
    ///
    /// Uses a pooled stream when one is idle, otherwise asks the agent for a
    /// new one and waits up to `work_conn_timeout`. A timeout only fails this
    /// request.
    pub async fn request_work_connection(
        &self,
        session_id: &str,
        proxy_name: &str,
    ) -> Result<MuxStream, ControlError> {
        let session = self.active_session(session_id)?;

        if let Some(stream) = session.take_pooled() {
            debug!(session_id = %session_id, proxy = %proxy_name, stream = stream.id(), "Using pooled work connection");
            if let Err(e) = session
                .send(Message::NewWorkConn {
                    correlation_id: None,
                })
                .await
            {
                debug!("Pool refill not requested: {}", e);
            }
            return Ok(stream);
        }

        let (correlation_id, rx) = session.pending().register();
        session
            .send(Message::NewWorkConn {
                correlation_id: Some(correlation_id),
            })
            .await
            .inspect_err(|_| session.pending().cancel(correlation_id))?;

        match tokio::time::timeout(self.config.work_conn_timeout, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) => Err(ControlError::Transport(
                "session closed while waiting for a work connection".to_string(),
            )),
            Err(_) => {
                session.pending().cancel(correlation_id);
                warn!(
                    session_id = %session_id,
                    proxy = %proxy_name,
                    correlation_id,
                    "Work connection request timed out"
                );
                self.emit(SessionEvent::WorkConnTimeout {
                    session_id: session_id.to_string(),
                    proxy: proxy_name.to_string(),
                });
                Err(ControlError::WorkTimeout {
                    proxy: proxy_name.to_string(),
                })
            }
        }
    }

    /// Resolve `proxy_name` to its agent and prepare a stream for one inbound connection
    pub async fn connect_proxy(
        &self,
        proxy_name: &str,
        src_addr: String,
        dst_port: u16,
    ) -> Result<WorkConn, ControlError> {
        let (config, session_id) = self
            .registry
            .lookup(proxy_name)
            .ok_or_else(|| ControlError::RouteMiss(format!("proxy {} is gone", proxy_name)))?;

        let mut stream = self
            .request_work_connection(&session_id, proxy_name)
            .await?;

        let start = Message::StartWorkConn {
            proxy_name: proxy_name.to_string(),
            src_addr,
            dst_port,
        };
        write_message(&mut stream, &start).await?;

        Ok(WorkConn {
            stream,
            config,
            session_id,
        })
    }

    /// Accept agent-opened streams and sort them into waiters or the pool
    async fn accept_work_streams(self: Arc<Self>, session: Arc<Session>) {
        let mux = session.mux().clone();
        while let Some(stream) = mux.accept_stream().await {
            let session = session.clone();
            let handshake_timeout = self.config.login_timeout;
            tokio::spawn(async move {
                register_work_stream(&session, stream, handshake_timeout).await;
            });
        }
        debug!(session_id = %session.id(), "Work stream acceptor stopped");
    }

    /// Tear a session down: unbind proxies, fail waiters, reset streams
    ///
    /// Idempotent; only the first call for a session does anything.
    pub async fn close_session(&self, session_id: &str, reason: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        if !session.transition(SessionState::Closing) {
            return;
        }

        self.sessions.remove(session_id);
        self.run_ids
            .remove_if(session.run_id(), |_, id| id.as_str() == session_id);

        let mut names = session.take_proxies();
        for name in self.registry.proxies_of(session_id) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        for name in &names {
            self.unbind(session_id, name);
        }

        let failed = session.abort_streams();
        session.mux().close().await;
        session.transition(SessionState::Closed);

        info!(
            session_id = %session_id,
            run_id = %session.run_id(),
            proxies = names.len(),
            failed_requests = failed,
            "Session closed: {}", reason
        );
        self.emit(SessionEvent::Disconnected {
            session_id: session_id.to_string(),
            run_id: session.run_id().to_string(),
            reason: reason.to_string(),
        });
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_session(&id, "relay shutting down").await;
        }
        self.listeners.abort_all();
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().info()).collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));

        ServerSnapshot {
            generated_at: Utc::now(),
            sessions,
            proxies: self.registry.proxies(),
            routes: self
                .registry
                .router()
                .map(|r| r.routes())
                .unwrap_or_default(),
        }
    }
}

/// Read the `WorkConnReady` handshake and route the stream
async fn register_work_stream(session: &Session, mut stream: MuxStream, timeout: Duration) {
    let msg = match tokio::time::timeout(timeout, read_message(&mut stream)).await {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(session_id = %session.id(), "Bad work stream handshake: {}", e);
            stream.reset();
            return;
        }
        Err(_) => {
            warn!(session_id = %session.id(), "Work stream handshake timed out");
            stream.reset();
            return;
        }
    };

    let (run_id, correlation_id) = match msg {
        Message::WorkConnReady {
            run_id,
            correlation_id,
        } => (run_id, correlation_id),
        other => {
            warn!(session_id = %session.id(), "Expected WorkConnReady, got {}", other.kind());
            stream.reset();
            return;
        }
    };

    if run_id != session.run_id() {
        warn!(session_id = %session.id(), run_id = %run_id, "Work stream from a different run id");
        stream.reset();
        return;
    }

    let stream = match correlation_id {
        Some(id) => match session.pending().complete(id, stream) {
            Ok(()) => return,
            // Requester gave up; keep the stream if the pool has room
            Err(stream) => stream,
        },
        None => stream,
    };

    if !session.offer_pooled(stream) {
        debug!(session_id = %session.id(), "Work pool full, dropping stream");
    }
}
