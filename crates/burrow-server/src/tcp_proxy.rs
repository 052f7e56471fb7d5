//! Dedicated public listeners for tcp proxies

use crate::error::ServerError;
use burrow_control::{ControlHandler, TcpProxySpawner};
use burrow_mux::splice;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bind, retrying while a just-released port lingers in TIME_WAIT
pub async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let mut last_error = None;
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Bound {} on attempt {}/{}", addr, attempt, BIND_ATTEMPTS);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying",
                    addr.port(),
                    attempt,
                    BIND_ATTEMPTS
                );
                last_error = Some(e);
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                last_error = Some(e);
                break;
            }
        }
    }

    Err(ServerError::Bind {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "address in use".to_string()),
    })
}

/// Spawner that binds `proxy_bind_addr:port` for each new tcp proxy
pub fn tcp_proxy_spawner() -> TcpProxySpawner {
    let spawner: TcpProxySpawner =
        Arc::new(move |handler: Arc<ControlHandler>, proxy: String, port: u16| {
            Box::pin(async move {
                let addr = SocketAddr::new(handler.config().proxy_bind_addr, port);
                let listener = bind_with_retry(addr).await.map_err(|e| e.to_string())?;
                info!(proxy = %proxy, "TCP proxy listening on {}", addr);
                Ok(tokio::spawn(serve(listener, handler)))
            })
        });
    spawner
}

/// Accept loop for one tcp proxy port
pub async fn serve(listener: TcpListener, handler: Arc<ControlHandler>) {
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            error!("TCP proxy listener has no local address: {}", e);
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_tcp_connection(handler, socket, peer_addr, port).await;
                });
            }
            Err(e) => {
                error!("Failed to accept TCP connection on port {}: {}", port, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_tcp_connection(
    handler: Arc<ControlHandler>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
) {
    let _ = socket.set_nodelay(true);

    let Some(proxy) = handler.registry().lookup_by_port(port) else {
        debug!("No proxy on port {} anymore, dropping {}", port, peer_addr);
        return;
    };

    let work = match handler
        .connect_proxy(&proxy, peer_addr.to_string(), port)
        .await
    {
        Ok(work) => work,
        Err(e) => {
            warn!(proxy = %proxy, "Dropping connection from {}: {}", peer_addr, e);
            return;
        }
    };

    debug!(proxy = %proxy, stream = work.stream.id(), "Forwarding connection from {}", peer_addr);
    match splice(socket, work.stream, &[]).await {
        Ok(stats) => debug!(
            proxy = %proxy,
            "Connection from {} closed ({} bytes in, {} bytes out)",
            peer_addr, stats.a_to_b, stats.b_to_a
        ),
        Err(e) => debug!(proxy = %proxy, "Connection from {} aborted: {}", peer_addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_conflict_reports_port() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap();

        let err = bind_with_retry(addr).await.unwrap_err();
        match err {
            ServerError::Bind { port, .. } => assert_eq!(port, addr.port()),
            other => panic!("unexpected error: {}", other),
        }
    }
}
