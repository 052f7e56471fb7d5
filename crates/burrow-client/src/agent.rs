//! Agent runtime: control session, proxy registration and work connections

use crate::config::AgentConfig;
use crate::error::AgentError;
use burrow_auth::privilege_key;
use burrow_mux::{splice, Multiplexer, MuxStream};
use burrow_proto::{
    read_message, write_message, AgentMetadata, Message, MessageCodec, ProxyConfig,
    PROTOCOL_VERSION,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// Longest wait between reconnect attempts, in seconds
const MAX_BACKOFF_SECS: u64 = 30;

/// Lifecycle notifications from a running agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    LoggedIn { run_id: String, session_id: String },
    ProxyReady { name: String, remote_addr: String },
    ProxyFailed { name: String, error: String },
    Disconnected { reason: String },
}

/// A logged-in control connection, ready to be served
pub struct AgentSession {
    mux: Multiplexer,
    control: Framed<MuxStream, MessageCodec>,
    run_id: String,
    session_id: String,
}

impl AgentSession {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Exposes local services through a relay
pub struct Agent {
    config: AgentConfig,
    proxies: Arc<HashMap<String, ProxyConfig>>,
    /// Identity assigned by the relay, resumed on reconnect
    run_id: Mutex<String>,
    events: broadcast::Sender<AgentEvent>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let proxies = config
            .proxy_configs()
            .into_iter()
            .map(|proxy| (proxy.name.clone(), proxy))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            run_id: Mutex::new(config.run_id.clone()),
            config,
            proxies: Arc::new(proxies),
            events,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Run id of the last successful login, or the configured one
    pub fn run_id(&self) -> String {
        self.run_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    /// Dial the relay and log in
    pub async fn connect(&self) -> Result<AgentSession, AgentError> {
        let addr = self.config.server_addr.clone();
        let stream = match tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(AgentError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(AgentError::Connect {
                    addr,
                    reason: "timed out".to_string(),
                })
            }
        };
        stream.set_nodelay(true)?;
        self.login(stream).await
    }

    /// Log in over an established transport and register every proxy
    pub async fn login<T>(&self, io: T) -> Result<AgentSession, AgentError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mux = Multiplexer::client(io);
        let control = mux
            .control_stream()
            .ok_or_else(|| AgentError::Protocol("control stream unavailable".to_string()))?;
        let mut control = Framed::new(control, MessageCodec);

        let timestamp = Utc::now().timestamp();
        let login = Message::Login {
            version: PROTOCOL_VERSION,
            run_id: self.run_id(),
            privilege_key: self
                .config
                .token
                .as_deref()
                .map(|token| privilege_key(token, timestamp))
                .unwrap_or_default(),
            timestamp,
            pool_count: self.config.pool_count,
            metadata: AgentMetadata::default(),
        };
        control.send(login).await?;

        let resp = tokio::time::timeout(self.config.dial_timeout, control.next())
            .await
            .map_err(|_| AgentError::Protocol("timed out waiting for login response".to_string()))?;
        let (run_id, session_id) = match resp {
            Some(Ok(Message::LoginResp {
                error: Some(reason),
                ..
            })) => {
                mux.close().await;
                return Err(AgentError::LoginRejected(reason));
            }
            Some(Ok(Message::LoginResp {
                run_id, session_id, ..
            })) => (run_id, session_id),
            Some(Ok(other)) => {
                mux.close().await;
                return Err(AgentError::Protocol(format!(
                    "expected LoginResp, got {}",
                    other.kind()
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(AgentError::Disconnected),
        };

        *self.run_id.lock().unwrap_or_else(PoisonError::into_inner) = run_id.clone();
        info!(run_id = %run_id, session_id = %session_id, "Logged in to relay");
        self.emit(AgentEvent::LoggedIn {
            run_id: run_id.clone(),
            session_id: session_id.clone(),
        });

        for config in self.proxies.values() {
            control
                .feed(Message::NewProxy {
                    config: config.clone(),
                })
                .await?;
        }
        control.flush().await?;

        Ok(AgentSession {
            mux,
            control,
            run_id,
            session_id,
        })
    }

    /// Serve one session until it ends
    ///
    /// Returns `Ok(())` only when `shutdown` fired; any other end of the
    /// session is an error.
    pub async fn serve(
        &self,
        session: AgentSession,
        shutdown: &CancellationToken,
    ) -> Result<(), AgentError> {
        let AgentSession {
            mux,
            mut control,
            run_id,
            ..
        } = session;

        let result = self
            .control_loop(&mux, &mut control, &run_id, shutdown)
            .await;
        mux.close().await;

        let reason = match &result {
            Ok(()) => "shutdown".to_string(),
            Err(e) => e.to_string(),
        };
        self.emit(AgentEvent::Disconnected { reason });
        result
    }

    async fn control_loop(
        &self,
        mux: &Multiplexer,
        control: &mut Framed<MuxStream, MessageCodec>,
        run_id: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Logging out of relay");
                    let _ = control
                        .send(Message::Logout {
                            reason: "agent shutting down".to_string(),
                        })
                        .await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.heartbeat_timeout {
                        warn!("Relay silent for {:?}", last_seen.elapsed());
                        return Err(AgentError::HeartbeatTimeout(self.config.heartbeat_timeout));
                    }
                    let timestamp = Utc::now().timestamp_millis().max(0) as u64;
                    control.send(Message::Ping { timestamp }).await?;
                }
                msg = control.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(AgentError::Disconnected),
                    };
                    last_seen = Instant::now();
                    self.handle_message(mux, run_id, msg)?;
                }
            }
        }
    }

    fn handle_message(&self, mux: &Multiplexer, run_id: &str, msg: Message) -> Result<(), AgentError> {
        match msg {
            Message::Pong { timestamp } => {
                let now = Utc::now().timestamp_millis().max(0) as u64;
                trace!("Pong from relay, rtt {}ms", now.saturating_sub(timestamp));
            }
            Message::NewProxyResp {
                name,
                remote_addr,
                error: None,
            } => {
                info!(proxy = %name, "Proxy available at {}", remote_addr);
                self.emit(AgentEvent::ProxyReady { name, remote_addr });
            }
            Message::NewProxyResp {
                name,
                error: Some(error),
                ..
            } => {
                error!(proxy = %name, "Relay rejected proxy: {}", error);
                self.emit(AgentEvent::ProxyFailed { name, error });
            }
            Message::NewWorkConn { correlation_id } => {
                let mux = mux.clone();
                let run_id = run_id.to_string();
                let proxies = self.proxies.clone();
                let dial_timeout = self.config.dial_timeout;
                tokio::spawn(async move {
                    if let Err(e) =
                        run_work_conn(mux, run_id, correlation_id, proxies, dial_timeout).await
                    {
                        warn!("Work connection failed: {}", e);
                    }
                });
            }
            Message::Logout { reason } => {
                info!("Relay closed the session: {}", reason);
                return Err(AgentError::Disconnected);
            }
            other => {
                warn!("Unexpected control message: {}", other.kind());
            }
        }
        Ok(())
    }

    /// Connect and serve one session
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let session = self.connect().await?;
        self.serve(session, &shutdown).await
    }

    /// Keep a session up until `shutdown`, reconnecting with exponential backoff
    ///
    /// Gives up on configuration errors and on a login the relay rejects
    /// before any session was established.
    pub async fn run_with_reconnect(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut reconnect_attempt = 0u32;
        let mut logged_in_once = false;

        loop {
            let delay = backoff_delay(reconnect_attempt);
            if !delay.is_zero() {
                info!("Waiting {} seconds before reconnecting...", delay.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }

            info!(
                "Connecting to relay {} (attempt {})",
                self.config.server_addr,
                reconnect_attempt + 1
            );
            let session = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.cancelled() => return Ok(()),
            };

            match session {
                Ok(session) => {
                    reconnect_attempt = 0;
                    logged_in_once = true;
                    match self.serve(session, &shutdown).await {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!("Session ended: {}", e),
                    }
                }
                Err(e) if e.is_permanent() && !logged_in_once => {
                    error!("Giving up: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Failed to connect: {}", e);
                }
            }
            reconnect_attempt += 1;
        }
    }
}

/// Delay before reconnect attempt `attempt`: none, then 1s, 2s, 4s... up to 30s
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let secs = 2u64.saturating_pow(attempt - 1).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Open a work stream, wait for the relay to assign it, then splice it to the
/// local service
async fn run_work_conn(
    mux: Multiplexer,
    run_id: String,
    correlation_id: Option<u64>,
    proxies: Arc<HashMap<String, ProxyConfig>>,
    dial_timeout: Duration,
) -> Result<(), AgentError> {
    let mut stream = mux.open_stream()?;
    write_message(
        &mut stream,
        &Message::WorkConnReady {
            run_id,
            correlation_id,
        },
    )
    .await?;

    // Pooled streams idle here until the relay needs them
    let (proxy_name, src_addr) = match read_message(&mut stream).await? {
        Some(Message::StartWorkConn {
            proxy_name,
            src_addr,
            ..
        }) => (proxy_name, src_addr),
        Some(other) => {
            stream.reset();
            return Err(AgentError::Protocol(format!(
                "expected StartWorkConn, got {}",
                other.kind()
            )));
        }
        None => {
            trace!("Work stream {} released before use", stream.id());
            return Ok(());
        }
    };

    let Some(proxy) = proxies.get(&proxy_name) else {
        stream.reset();
        return Err(AgentError::Protocol(format!(
            "relay assigned unknown proxy '{}'",
            proxy_name
        )));
    };

    let local_addr = proxy.local_addr();
    let local = match tokio::time::timeout(dial_timeout, TcpStream::connect(&local_addr)).await {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            stream.reset();
            return Err(AgentError::Connect {
                addr: local_addr,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            stream.reset();
            return Err(AgentError::Connect {
                addr: local_addr,
                reason: "timed out".to_string(),
            });
        }
    };
    let _ = local.set_nodelay(true);

    debug!(proxy = %proxy_name, stream = stream.id(), "Forwarding {} to {}", src_addr, local_addr);
    let stats = splice(stream, local, &[]).await?;
    debug!(
        proxy = %proxy_name,
        "Connection from {} closed ({} bytes in, {} bytes out)",
        src_addr,
        stats.a_to_b,
        stats.b_to_a
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let secs: Vec<u64> = (0..8).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![0, 1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = AgentConfig::new("");
        assert!(matches!(Agent::new(config), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_configured_run_id_is_resumed() {
        let mut config = AgentConfig::new("relay:7000");
        config.run_id = "abc".to_string();
        let agent = Agent::new(config).unwrap();
        assert_eq!(agent.run_id(), "abc");
    }
}
