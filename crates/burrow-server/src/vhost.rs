//! Shared HTTP listener routing requests by `Host` and path

use crate::exchange::{
    exchange, read_request_head, ExchangeError, HeadError, RequestHead, ResponseEnd,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use burrow_control::{ControlError, ControlHandler};
use burrow_mux::{splice, MuxStream};
use burrow_proto::ProxyKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Accept loop for the vhost port
pub async fn serve(listener: TcpListener, handler: Arc<ControlHandler>) {
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            error!("Vhost listener has no local address: {}", e);
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_http_connection(handler, socket, peer_addr, port).await;
                });
            }
            Err(e) => {
                error!("Failed to accept HTTP connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve one inbound connection, routing each request on it separately
async fn handle_http_connection(
    handler: Arc<ControlHandler>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
) {
    let _ = socket.set_nodelay(true);
    let config = handler.config();
    let mut buf = Vec::new();

    loop {
        let head = match read_request_head(
            &mut socket,
            &mut buf,
            config.vhost_max_header_bytes,
            config.vhost_read_timeout,
        )
        .await
        {
            Ok(head) => head,
            Err(HeadError::Closed) => return,
            Err(e @ (HeadError::TimedOut | HeadError::Io(_))) => {
                debug!("Dropping HTTP connection from {}: {}", peer_addr, e);
                return;
            }
            Err(e) => {
                debug!("Bad request from {}: {}", peer_addr, e);
                respond(&mut socket, 400, "Bad Request", "").await;
                return;
            }
        };

        let Some((proxy, stream)) =
            open_work_stream(&handler, &mut socket, &head, peer_addr, port).await
        else {
            return;
        };

        if head.upgrade {
            let mut prefix = head.raw;
            prefix.append(&mut buf);
            debug!(proxy = %proxy, "Upgrading connection from {}", peer_addr);
            if let Err(e) = splice(socket, stream, &prefix).await {
                debug!(proxy = %proxy, "Upgraded connection from {} aborted: {}", peer_addr, e);
            }
            return;
        }

        match exchange(&mut socket, &mut buf, stream, &head).await {
            Ok(ResponseEnd::KeepAlive) => continue,
            Ok(ResponseEnd::Close) => {
                let _ = socket.shutdown().await;
                return;
            }
            Err(ExchangeError::NoResponse(reason)) => {
                debug!(proxy = %proxy, "No response for {}: {}", peer_addr, reason);
                respond(&mut socket, 502, "Bad Gateway", "").await;
                return;
            }
            Err(e) => {
                debug!(proxy = %proxy, "HTTP connection from {} aborted: {}", peer_addr, e);
                return;
            }
        }
    }
}

/// Route a request and get a work stream for it
///
/// Failures are answered on `socket`, which is then finished.
async fn open_work_stream(
    handler: &ControlHandler,
    socket: &mut TcpStream,
    head: &RequestHead,
    peer_addr: SocketAddr,
    port: u16,
) -> Option<(String, MuxStream)> {
    let Some(host) = head.host.as_deref() else {
        respond(socket, 400, "Bad Request", "").await;
        return None;
    };
    let path = head.path.split('?').next().unwrap_or("/");

    let Some(router) = handler.registry().router() else {
        respond(socket, 404, "Not Found", "").await;
        return None;
    };
    let route = match router.match_route(host, path) {
        Ok(route) => route,
        Err(e) => {
            debug!("{} {} from {}: {}", head.method, path, peer_addr, e);
            respond(socket, 404, "Not Found", "").await;
            return None;
        }
    };

    let Some((proxy_config, _)) = handler.registry().lookup(&route.proxy) else {
        respond(socket, 404, "Not Found", "").await;
        return None;
    };

    if let ProxyKind::Http(options) = &proxy_config.kind {
        if let (Some(user), Some(pwd)) = (&options.http_user, &options.http_pwd) {
            if !check_basic_auth(head.authorization.as_deref(), user, pwd) {
                respond(
                    socket,
                    401,
                    "Unauthorized",
                    "WWW-Authenticate: Basic realm=\"Restricted\"\r\n",
                )
                .await;
                return None;
            }
        }
    }

    match handler
        .connect_proxy(&route.proxy, peer_addr.to_string(), port)
        .await
    {
        Ok(work) => {
            debug!(
                proxy = %route.proxy,
                stream = work.stream.id(),
                "{} {}{} from {}", head.method, host, path, peer_addr
            );
            Some((route.proxy, work.stream))
        }
        Err(e) => {
            warn!(proxy = %route.proxy, "Cannot serve {} {}{}: {}", head.method, host, path, e);
            let (status, reason) = error_status(&e);
            respond(socket, status, reason, "").await;
            None
        }
    }
}

fn error_status(err: &ControlError) -> (u16, &'static str) {
    match err {
        ControlError::WorkTimeout { .. } => (504, "Gateway Timeout"),
        ControlError::RouteMiss(_) => (404, "Not Found"),
        _ => (502, "Bad Gateway"),
    }
}

async fn respond(socket: &mut TcpStream, status: u16, reason: &str, extra_headers: &str) {
    let body = format!("{} {}\n", status, reason);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
        status,
        reason,
        body.len(),
        extra_headers,
        body
    );
    if socket.write_all(response.as_bytes()).await.is_ok() {
        let _ = socket.shutdown().await;
    }
}

fn check_basic_auth(header: Option<&str>, user: &str, pwd: &str) -> bool {
    let Some((scheme, encoded)) = header.and_then(|h| h.split_once(' ')) else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((u, p)) = credentials.split_once(':') else {
        return false;
    };
    let user_ok = u.as_bytes().ct_eq(user.as_bytes());
    let pwd_ok = p.as_bytes().ct_eq(pwd.as_bytes());
    (user_ok & pwd_ok).into()
}
