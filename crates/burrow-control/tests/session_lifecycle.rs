//! Control session behavior against an in-memory agent

use burrow_auth::{privilege_key, StaticTokenVerifier};
use burrow_control::{ControlError, ControlHandler, ServerConfig, SessionEvent, TcpProxySpawner};
use burrow_mux::{Multiplexer, MuxStream};
use burrow_proto::{
    read_message, write_message, AgentMetadata, HttpProxyOptions, Message, MessageCodec,
    ProxyConfig, PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const TOKEN: &str = "test-token";
const WAIT: Duration = Duration::from_secs(5);

type Control = Framed<MuxStream, MessageCodec>;

struct TestAgent {
    mux: Multiplexer,
    control: Control,
    session_id: String,
    run_id: String,
}

fn config() -> ServerConfig {
    ServerConfig {
        vhost_http_port: Some(8080),
        work_conn_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    }
}

fn handler(config: ServerConfig) -> Arc<ControlHandler> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    Arc::new(ControlHandler::new(
        config,
        Arc::new(StaticTokenVerifier::new(TOKEN)),
    ))
}

fn login(token: &str, run_id: &str, pool_count: u32) -> Message {
    let timestamp = chrono::Utc::now().timestamp();
    Message::Login {
        version: PROTOCOL_VERSION,
        run_id: run_id.to_string(),
        privilege_key: privilege_key(token, timestamp),
        timestamp,
        pool_count,
        metadata: AgentMetadata::default(),
    }
}

async fn try_connect(
    handler: &Arc<ControlHandler>,
    msg: Message,
) -> (Multiplexer, Control, Message) {
    let (agent_io, relay_io) = tokio::io::duplex(1 << 20);
    tokio::spawn(handler.clone().handle_connection(relay_io, "test-peer".to_string()));

    let mux = Multiplexer::client(agent_io);
    let mut control = Framed::new(mux.control_stream().unwrap(), MessageCodec);
    control.send(msg).await.unwrap();
    let resp = timeout(WAIT, control.next()).await.unwrap().unwrap().unwrap();
    (mux, control, resp)
}

async fn connect(handler: &Arc<ControlHandler>, run_id: &str, pool_count: u32) -> TestAgent {
    let (mux, control, resp) = try_connect(handler, login(TOKEN, run_id, pool_count)).await;
    match resp {
        Message::LoginResp {
            session_id,
            run_id,
            error: None,
            ..
        } => TestAgent {
            mux,
            control,
            session_id,
            run_id,
        },
        other => panic!("unexpected login response: {:?}", other),
    }
}

impl TestAgent {
    async fn recv(&mut self) -> Message {
        timeout(WAIT, self.control.next())
            .await
            .expect("timed out waiting for a control message")
            .expect("control stream closed")
            .unwrap()
    }

    async fn new_proxy(&mut self, config: ProxyConfig) -> (String, Option<String>) {
        self.control
            .send(Message::NewProxy { config })
            .await
            .unwrap();
        loop {
            match self.recv().await {
                Message::NewProxyResp {
                    remote_addr, error, ..
                } => return (remote_addr, error),
                Message::NewWorkConn { .. } => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    /// Answer work requests by opening streams that echo their input
    fn serve_echo(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(Ok(msg)) = self.control.next().await {
                if let Message::NewWorkConn { correlation_id } = msg {
                    let mut stream = self.mux.open_stream().unwrap();
                    let run_id = self.run_id.clone();
                    tokio::spawn(async move {
                        let ready = Message::WorkConnReady {
                            run_id,
                            correlation_id,
                        };
                        write_message(&mut stream, &ready).await.unwrap();
                        let Ok(Some(Message::StartWorkConn { .. })) =
                            read_message(&mut stream).await
                        else {
                            return;
                        };
                        let (mut r, mut w) = tokio::io::split(stream);
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                        let _ = w.shutdown().await;
                    });
                }
            }
        })
    }
}

async fn wait_for_event<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed")
}

async fn echo_through(handler: &ControlHandler, proxy: &str, payload: &[u8]) -> Vec<u8> {
    let mut work = handler
        .connect_proxy(proxy, "203.0.113.7:50000".to_string(), 6000)
        .await
        .unwrap();
    work.stream.write_all(payload).await.unwrap();
    work.stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(WAIT, work.stream.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    echoed
}

#[tokio::test]
async fn test_login_with_wrong_token_is_rejected() {
    let handler = handler(config());
    let (_mux, _control, resp) = try_connect(&handler, login("wrong", "agent", 0)).await;

    match resp {
        Message::LoginResp { error, .. } => assert!(error.is_some()),
        other => panic!("unexpected response: {:?}", other),
    }
    assert_eq!(handler.session_count(), 0);
}

#[tokio::test]
async fn test_login_with_wrong_version_is_rejected() {
    let handler = handler(config());
    let mut msg = login(TOKEN, "agent", 0);
    if let Message::Login { version, .. } = &mut msg {
        *version = PROTOCOL_VERSION + 1;
    }
    let (_mux, _control, resp) = try_connect(&handler, msg).await;

    assert!(matches!(resp, Message::LoginResp { error: Some(_), .. }));
    assert_eq!(handler.session_count(), 0);
}

#[tokio::test]
async fn test_empty_run_id_gets_assigned() {
    let handler = handler(config());
    let agent = connect(&handler, "", 0).await;

    assert!(!agent.run_id.is_empty());
    assert!(handler.session_by_run_id(&agent.run_id).is_some());
}

#[tokio::test]
async fn test_http_proxy_registration() {
    let handler = handler(config());
    let mut agent = connect(&handler, "agent-1", 0).await;

    let options =
        HttpProxyOptions::with_domains(["normal.example.com"]).with_locations(["/", "/foo"]);
    let (remote_addr, error) = agent
        .new_proxy(ProxyConfig::http("foo", 3000, options))
        .await;
    assert_eq!(error, None);
    assert_eq!(remote_addr, "http://normal.example.com:8080");

    let snapshot = handler.snapshot();
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions[0].proxies, vec!["foo"]);
    assert_eq!(snapshot.proxies.len(), 1);
    assert_eq!(snapshot.routes.len(), 2);
}

#[tokio::test]
async fn test_rejected_proxy_keeps_session() {
    let handler = handler(config());
    let mut agent = connect(&handler, "agent-1", 0).await;

    let (_, error) = agent.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;
    assert_eq!(error, None);
    let (_, error) = agent.new_proxy(ProxyConfig::tcp("ssh", 22, 6001)).await;
    assert!(error.unwrap().contains("already registered"));

    agent
        .control
        .send(Message::Ping { timestamp: 42 })
        .await
        .unwrap();
    assert_eq!(agent.recv().await, Message::Pong { timestamp: 42 });
    assert_eq!(handler.session_count(), 1);
}

#[tokio::test]
async fn test_close_proxy_unbinds_routes() {
    let handler = handler(config());
    let mut events = handler.subscribe();
    let mut agent = connect(&handler, "agent-1", 0).await;

    let options = HttpProxyOptions::with_domains(["a.example.com"]);
    agent.new_proxy(ProxyConfig::http("web", 3000, options)).await;

    agent
        .control
        .send(Message::CloseProxy {
            name: "web".to_string(),
        })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::ProxyUnbound { .. })).await;

    let router = handler.registry().router().unwrap();
    assert!(router.match_route("a.example.com", "/").is_err());
    assert!(handler.registry().is_empty());
}

#[tokio::test]
async fn test_remove_proxy_requires_owner() {
    let handler = handler(config());
    let mut a = connect(&handler, "agent-a", 0).await;
    let b = connect(&handler, "agent-b", 0).await;

    a.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;

    assert!(matches!(
        handler.remove_proxy(&b.session_id, "ssh"),
        Err(ControlError::Validation(_))
    ));
    // Unknown names are fine
    handler.remove_proxy(&b.session_id, "nope").unwrap();
    handler.remove_proxy(&a.session_id, "ssh").unwrap();
    handler.remove_proxy(&a.session_id, "ssh").unwrap();
    assert!(handler.registry().is_empty());
}

#[tokio::test]
async fn test_silent_session_times_out() {
    let handler = handler(ServerConfig {
        heartbeat_timeout: Duration::from_millis(300),
        heartbeat_check_interval: Duration::from_millis(50),
        ..config()
    });
    let mut events = handler.subscribe();
    let mut agent = connect(&handler, "agent-1", 0).await;
    agent.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;

    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    match event {
        SessionEvent::Disconnected { reason, .. } => assert_eq!(reason, "heartbeat timeout"),
        _ => unreachable!(),
    }

    assert_eq!(handler.session_count(), 0);
    assert!(handler.registry().lookup("ssh").is_none());
    assert!(handler.registry().lookup_by_port(6000).is_none());
}

#[tokio::test]
async fn test_pings_keep_session_alive() {
    let handler = handler(ServerConfig {
        heartbeat_timeout: Duration::from_millis(300),
        heartbeat_check_interval: Duration::from_millis(50),
        ..config()
    });
    let mut agent = connect(&handler, "agent-1", 0).await;

    for timestamp in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.control.send(Message::Ping { timestamp }).await.unwrap();
        assert_eq!(agent.recv().await, Message::Pong { timestamp });
    }
    assert_eq!(handler.session_count(), 1);
}

#[tokio::test]
async fn test_work_connection_on_demand() {
    let handler = handler(config());
    let mut agent = connect(&handler, "agent-1", 0).await;
    agent.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;
    let _agent_task = agent.serve_echo();

    let echoed = echo_through(&handler, "ssh", b"hello through the tunnel").await;
    assert_eq!(echoed, b"hello through the tunnel");
}

#[tokio::test]
async fn test_work_connection_timeout_leaves_session() {
    let handler = handler(config());
    let mut events = handler.subscribe();
    let mut agent = connect(&handler, "agent-1", 0).await;
    agent.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;

    // The agent never answers NewWorkConn
    let result = handler
        .connect_proxy("ssh", "203.0.113.7:1".to_string(), 6000)
        .await;
    assert!(matches!(result, Err(ControlError::WorkTimeout { .. })));
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::WorkConnTimeout { .. })
    })
    .await;

    assert!(matches!(
        agent.recv().await,
        Message::NewWorkConn {
            correlation_id: Some(_)
        }
    ));
    assert_eq!(handler.session_count(), 1);
    assert!(handler.registry().lookup("ssh").is_some());
}

#[tokio::test]
async fn test_pooled_work_connections() {
    let handler = handler(config());
    let agent = connect(&handler, "agent-1", 2).await;
    let session_id = agent.session_id.clone();
    let _agent_task = agent.serve_echo();
    handler
        .add_proxy(&session_id, ProxyConfig::tcp("ssh", 22, 6000))
        .await
        .unwrap();

    let session = handler.session(&session_id).unwrap();
    timeout(WAIT, async {
        while session.pooled() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let echoed = echo_through(&handler, "ssh", b"pooled").await;
    assert_eq!(echoed, b"pooled");

    // Refilled after use
    timeout(WAIT, async {
        while session.pooled() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_pool_count_is_capped() {
    let handler = handler(ServerConfig {
        max_pool_count: 1,
        ..config()
    });
    let agent = connect(&handler, "agent-1", 10).await;
    let session = handler.session(&agent.session_id).unwrap();
    assert_eq!(session.pool_count(), 1);
}

#[tokio::test]
async fn test_relogin_replaces_session() {
    let handler = handler(config());
    let mut events = handler.subscribe();

    let mut first = connect(&handler, "agent-1", 0).await;
    first.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;

    let mut second = connect(&handler, "agent-1", 0).await;
    assert_ne!(first.session_id, second.session_id);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(event.session_id(), first.session_id);
    assert_eq!(handler.session_count(), 1);

    // The port is free for the replacement session
    let (_, error) = second.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;
    assert_eq!(error, None);

    // Old agent sees its connection end
    timeout(WAIT, first.mux.closed()).await.unwrap();
}

#[tokio::test]
async fn test_logout_closes_session() {
    let handler = handler(config());
    let mut events = handler.subscribe();
    let mut agent = connect(&handler, "agent-1", 0).await;
    agent.new_proxy(ProxyConfig::tcp("ssh", 22, 6000)).await;

    agent
        .control
        .send(Message::Logout {
            reason: "shutdown".to_string(),
        })
        .await
        .unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    match event {
        SessionEvent::Disconnected { reason, .. } => assert!(reason.contains("shutdown")),
        _ => unreachable!(),
    }
    assert!(handler.registry().is_empty());
}

#[tokio::test]
async fn test_transport_loss_closes_session() {
    let handler = handler(config());
    let mut events = handler.subscribe();
    let agent = connect(&handler, "agent-1", 0).await;

    drop(agent);

    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(handler.session_count(), 0);
}

#[tokio::test]
async fn test_unknown_proxy_is_route_miss() {
    let handler = handler(config());
    let result = handler
        .connect_proxy("missing", "203.0.113.7:1".to_string(), 80)
        .await;
    assert!(matches!(result, Err(ControlError::RouteMiss(_))));
}

#[tokio::test]
async fn test_close_during_listener_bind_releases_listener() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let listener_alive = Arc::new(());

    let spawner: TcpProxySpawner = {
        let (entered, release, alive) = (entered.clone(), release.clone(), listener_alive.clone());
        Arc::new(move |_handler: Arc<ControlHandler>, _proxy: String, _port: u16| {
            let (entered, release, alive) = (entered.clone(), release.clone(), alive.clone());
            Box::pin(async move {
                entered.notify_one();
                release.notified().await;
                Ok(tokio::spawn(async move {
                    let _alive = alive;
                    std::future::pending::<()>().await
                }))
            })
        })
    };
    let handler = Arc::new(
        ControlHandler::new(config(), Arc::new(StaticTokenVerifier::new(TOKEN)))
            .with_tcp_proxy_spawner(spawner),
    );
    let agent = connect(&handler, "agent-1", 0).await;

    let adding = {
        let handler = handler.clone();
        let session_id = agent.session_id.clone();
        tokio::spawn(async move {
            handler
                .add_proxy(&session_id, ProxyConfig::tcp("ssh", 22, 6000))
                .await
        })
    };

    // The session goes away while the listener is still being bound
    timeout(WAIT, entered.notified()).await.unwrap();
    handler.close_session(&agent.session_id, "closed mid-bind").await;
    release.notify_one();

    let result = timeout(WAIT, adding).await.unwrap().unwrap();
    assert!(matches!(result, Err(ControlError::SessionNotFound(_))));
    assert!(handler.registry().lookup("ssh").is_none());

    timeout(WAIT, async {
        while Arc::strong_count(&listener_alive) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener outlived its session");
}
