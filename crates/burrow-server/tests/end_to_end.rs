//! Relay and agent talking over real loopback sockets

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use burrow_auth::{privilege_key, StaticTokenVerifier};
use burrow_client::{Agent, AgentConfig, AgentEvent, ProxyDef};
use burrow_control::{ControlHandler, ServerConfig, SessionEvent};
use burrow_mux::{Multiplexer, MuxStream};
use burrow_proto::{
    AgentMetadata, HttpProxyOptions, Message, MessageCodec, ProxyConfig, PROTOCOL_VERSION,
};
use burrow_server::Server;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "e2e-token";
const HOST: &str = "normal.example.com";
const WAIT: Duration = Duration::from_secs(10);
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Relay {
    handler: Arc<ControlHandler>,
    agent_addr: SocketAddr,
    vhost_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn relay_config() -> ServerConfig {
    ServerConfig {
        bind_addr: SocketAddr::new(LOCALHOST, 0),
        proxy_bind_addr: LOCALHOST,
        vhost_http_port: Some(0),
        work_conn_timeout: Duration::from_secs(3),
        ..ServerConfig::default()
    }
}

async fn start_relay(config: ServerConfig) -> Relay {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let server = Server::new(config, Arc::new(StaticTokenVerifier::new(TOKEN)))
        .bind()
        .await
        .unwrap();
    let relay = Relay {
        handler: server.handler(),
        agent_addr: server.agent_addr(),
        vhost_addr: server.vhost_addr().unwrap(),
        shutdown: CancellationToken::new(),
    };
    tokio::spawn(server.run(relay.shutdown.clone()));
    relay
}

/// Start an agent for `proxies` and wait until each proxy is bound
async fn start_agent(relay: &Relay, proxies: Vec<ProxyDef>) -> (Arc<Agent>, Vec<String>) {
    let mut config = AgentConfig::new(relay.agent_addr.to_string()).with_token(TOKEN);
    config.proxies = proxies;
    let expected = config.proxies.len();

    let agent = Arc::new(Agent::new(config).unwrap());
    let mut events = agent.subscribe();
    let shutdown = relay.shutdown.clone();
    let runner = agent.clone();
    tokio::spawn(async move { runner.run_with_reconnect(shutdown).await });

    let mut remote_addrs = Vec::new();
    timeout(WAIT, async {
        while remote_addrs.len() < expected {
            match events.recv().await.unwrap() {
                AgentEvent::ProxyReady { remote_addr, .. } => remote_addrs.push(remote_addr),
                AgentEvent::ProxyFailed { name, error } => {
                    panic!("proxy {} failed: {}", name, error)
                }
                _ => {}
            }
        }
    })
    .await
    .expect("proxies were not bound");
    (agent, remote_addrs)
}

/// Local HTTP service answering every request with `body`
async fn http_service(body: &'static str) -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

async fn echo_service() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    port
}

fn http_proxy(name: &str, local_port: u16, locations: &[&str]) -> ProxyDef {
    ProxyDef::Http {
        name: name.to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port,
        custom_domains: vec![HOST.to_string()],
        subdomain: None,
        locations: locations.iter().map(|l| l.to_string()).collect(),
        http_user: None,
        http_pwd: None,
    }
}

/// Send one request through the vhost port and return the whole response
async fn get(vhost: SocketAddr, host: &str, path: &str, extra_headers: &str) -> String {
    let mut socket = TcpStream::connect(vhost).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}Connection: close\r\n\r\n",
        path, host, extra_headers
    );
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(WAIT, socket.read_to_end(&mut response))
        .await
        .expect("response not received")
        .unwrap();
    String::from_utf8(response).unwrap()
}

/// Read one `Content-Length` framed response, leaving the connection open
async fn read_response(socket: &mut TcpStream) -> (String, String) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(WAIT, socket.read_exact(&mut byte))
            .await
            .expect("response not received")
            .unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length:"))
        .expect("response has no Content-Length")
        .trim()
        .parse()
        .unwrap();

    let mut body = vec![0u8; length];
    timeout(WAIT, socket.read_exact(&mut body))
        .await
        .unwrap()
        .unwrap();
    (head, String::from_utf8(body).unwrap())
}

/// Log in and register `proxy` without ever answering work requests
async fn mute_agent(
    relay: &Relay,
    proxy: ProxyConfig,
) -> (Multiplexer, Framed<MuxStream, MessageCodec>) {
    let io = TcpStream::connect(relay.agent_addr).await.unwrap();
    let mux = Multiplexer::client(io);
    let mut control = Framed::new(mux.control_stream().unwrap(), MessageCodec);

    let timestamp = chrono::Utc::now().timestamp();
    let login = Message::Login {
        version: PROTOCOL_VERSION,
        run_id: String::new(),
        privilege_key: privilege_key(TOKEN, timestamp),
        timestamp,
        pool_count: 0,
        metadata: AgentMetadata::default(),
    };
    control.send(login).await.unwrap();
    let resp = timeout(WAIT, control.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(resp, Message::LoginResp { error: None, .. }), "{:?}", resp);

    control.send(Message::NewProxy { config: proxy }).await.unwrap();
    loop {
        match timeout(WAIT, control.next()).await.unwrap().unwrap().unwrap() {
            Message::NewProxyResp { error: None, .. } => break,
            Message::NewProxyResp { error: Some(e), .. } => panic!("proxy rejected: {}", e),
            _ => {}
        }
    }
    (mux, control)
}

async fn wait_for_disconnect(events: &mut broadcast::Receiver<SessionEvent>) -> String {
    timeout(WAIT, async {
        loop {
            if let SessionEvent::Disconnected { reason, .. } = events.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .expect("session did not close")
}

#[tokio::test]
async fn test_vhost_routes_by_longest_prefix() {
    let relay = start_relay(relay_config()).await;
    let foo = http_service("foo").await;
    let bar = http_service("bar").await;
    let (_agent, addrs) = start_agent(
        &relay,
        vec![
            http_proxy("foo", foo, &["/", "/foo"]),
            http_proxy("bar", bar, &["/bar"]),
        ],
    )
    .await;
    assert!(addrs.iter().all(|a| a.starts_with("http://normal.example.com")));

    for (path, expected) in [
        ("/foo", "foo"),
        ("/bar", "bar"),
        ("/bar/baz?q=1", "bar"),
        ("/other", "foo"),
    ] {
        let response = get(relay.vhost_addr, HOST, path, "").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}: {}", path, response);
        assert!(response.ends_with(expected), "{}: {}", path, response);
    }
}

#[tokio::test]
async fn test_keep_alive_requests_are_routed_one_by_one() {
    let relay = start_relay(relay_config()).await;
    let foo = http_service("foo").await;
    let bar = http_service("bar").await;
    let _agent = start_agent(
        &relay,
        vec![
            http_proxy("foo", foo, &["/", "/foo"]),
            http_proxy("bar", bar, &["/bar"]),
        ],
    )
    .await;

    let mut socket = TcpStream::connect(relay.vhost_addr).await.unwrap();
    let mut bodies = Vec::new();
    for path in ["/foo", "/bar", "/other"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, HOST);
        socket.write_all(request.as_bytes()).await.unwrap();

        let (head, body) = read_response(&mut socket).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}: {}", path, head);
        assert!(!head.contains("Connection: close"), "{}: {}", path, head);
        bodies.push(body);
    }
    assert_eq!(bodies, ["foo", "bar", "foo"]);
}

#[tokio::test]
async fn test_unknown_host_gets_404() {
    let relay = start_relay(relay_config()).await;
    let foo = http_service("foo").await;
    let _agent = start_agent(&relay, vec![http_proxy("foo", foo, &["/"])]).await;

    let response = get(relay.vhost_addr, "unknown.example.com", "/", "").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
}

#[tokio::test]
async fn test_basic_auth_is_enforced() {
    let relay = start_relay(relay_config()).await;
    let port = http_service("secret").await;
    let proxy = ProxyDef::Http {
        name: "private".to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port: port,
        custom_domains: vec![HOST.to_string()],
        subdomain: None,
        locations: Vec::new(),
        http_user: Some("alice".to_string()),
        http_pwd: Some("s3cret".to_string()),
    };
    let _agent = start_agent(&relay, vec![proxy]).await;

    let denied = get(relay.vhost_addr, HOST, "/", "").await;
    assert!(denied.starts_with("HTTP/1.1 401"), "{}", denied);
    assert!(denied.contains("WWW-Authenticate: Basic"));

    let header = format!("Authorization: Basic {}\r\n", BASE64.encode("alice:s3cret"));
    let allowed = get(relay.vhost_addr, HOST, "/", &header).await;
    assert!(allowed.starts_with("HTTP/1.1 200"), "{}", allowed);
    assert!(allowed.ends_with("secret"));
}

#[tokio::test]
async fn test_unanswered_work_request_gets_504() {
    let config = ServerConfig {
        work_conn_timeout: Duration::from_millis(300),
        ..relay_config()
    };
    let relay = start_relay(config).await;
    let proxy = ProxyConfig::http("mute", 1, HttpProxyOptions::with_domains([HOST]));
    let (_mux, _control) = mute_agent(&relay, proxy).await;

    let started = Instant::now();
    let response = get(relay.vhost_addr, HOST, "/", "").await;
    assert!(response.starts_with("HTTP/1.1 504"), "{}", response);
    assert!(started.elapsed() >= Duration::from_millis(300));

    // Only the inbound connection failed
    assert_eq!(relay.handler.session_count(), 1);
    assert!(relay.handler.registry().lookup("mute").is_some());
}

#[tokio::test]
async fn test_tcp_proxy_carries_concurrent_connections() {
    let relay = start_relay(relay_config()).await;
    let local = echo_service().await;
    let proxy = ProxyDef::Tcp {
        name: "echo".to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port: local,
        remote_port: 0,
    };
    let (_agent, addrs) = start_agent(&relay, vec![proxy]).await;
    let remote: SocketAddr = addrs[0].parse().unwrap();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            tokio::spawn(async move {
                let payload = format!("connection {} says hello", i).repeat(1000);
                let mut socket = TcpStream::connect(remote).await.unwrap();
                let (mut r, mut w) = socket.split();
                let write = w.write_all(payload.as_bytes());
                let mut echoed = vec![0u8; payload.len()];
                let read = r.read_exact(&mut echoed);
                let (write, read) = tokio::join!(write, read);
                write.unwrap();
                read.unwrap();
                assert_eq!(echoed, payload.as_bytes());
            })
        })
        .collect();

    for client in clients {
        timeout(WAIT, client).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_silent_agent_loses_its_proxies() {
    let config = ServerConfig {
        heartbeat_timeout: Duration::from_millis(500),
        heartbeat_check_interval: Duration::from_millis(50),
        ..relay_config()
    };
    let relay = start_relay(config).await;
    let mut events = relay.handler.subscribe();
    let foo = http_service("foo").await;

    // An agent that logs in and then never pings
    let mut agent_config = AgentConfig::new(relay.agent_addr.to_string()).with_token(TOKEN);
    agent_config.heartbeat_interval = Duration::from_secs(3600);
    agent_config.proxies = vec![http_proxy("foo", foo, &["/"])];
    let agent = Agent::new(agent_config).unwrap();
    let session = agent.connect().await.unwrap();
    let shutdown = relay.shutdown.clone();
    tokio::spawn(async move { agent.serve(session, &shutdown).await });

    let reason = wait_for_disconnect(&mut events).await;
    assert_eq!(reason, "heartbeat timeout");
    assert!(relay.handler.registry().lookup("foo").is_none());

    let response = get(relay.vhost_addr, HOST, "/", "").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
}

#[tokio::test]
async fn test_agent_reconnects_with_same_run_id() {
    let relay = start_relay(relay_config()).await;
    let foo = http_service("foo").await;
    let (agent, _) = start_agent(&relay, vec![http_proxy("foo", foo, &["/"])]).await;
    let run_id = agent.run_id();
    let mut agent_events = agent.subscribe();

    let session = relay.handler.session_by_run_id(&run_id).unwrap();
    relay
        .handler
        .close_session(session.id(), "kicked by test")
        .await;

    let logged_in = timeout(WAIT, async {
        loop {
            if let AgentEvent::LoggedIn { run_id, .. } = agent_events.recv().await.unwrap() {
                return run_id;
            }
        }
    })
    .await
    .expect("agent did not reconnect");
    assert_eq!(logged_in, run_id);

    timeout(WAIT, async {
        while relay.handler.registry().lookup("foo").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let response = get(relay.vhost_addr, HOST, "/", "").await;
    assert!(response.ends_with("foo"), "{}", response);
}
