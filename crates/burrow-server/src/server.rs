//! Relay server: agent listener, vhost listener and tcp proxy listeners

use crate::error::ServerError;
use crate::tcp_proxy::{bind_with_retry, tcp_proxy_spawner};
use crate::vhost;
use burrow_auth::TokenVerifier;
use burrow_control::{ControlHandler, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Relay before its listeners are bound
pub struct Server {
    config: ServerConfig,
    verifier: Arc<dyn TokenVerifier>,
}

impl Server {
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Bind the agent and vhost ports
    ///
    /// Port 0 binds an ephemeral port; the bound ports are what the relay
    /// reports to agents.
    pub async fn bind(mut self) -> Result<BoundServer, ServerError> {
        let agent_listener = bind_with_retry(self.config.bind_addr).await?;
        let agent_addr = agent_listener.local_addr()?;

        let vhost_listener = match self.config.vhost_http_port {
            Some(port) => {
                let addr = SocketAddr::new(self.config.proxy_bind_addr, port);
                let listener = bind_with_retry(addr).await?;
                self.config.vhost_http_port = Some(listener.local_addr()?.port());
                Some(listener)
            }
            None => None,
        };

        let handler = Arc::new(
            ControlHandler::new(self.config, self.verifier)
                .with_tcp_proxy_spawner(tcp_proxy_spawner()),
        );

        Ok(BoundServer {
            handler,
            agent_listener,
            agent_addr,
            vhost_listener,
        })
    }
}

/// Relay with its listeners bound, ready to run
pub struct BoundServer {
    handler: Arc<ControlHandler>,
    agent_listener: TcpListener,
    agent_addr: SocketAddr,
    vhost_listener: Option<TcpListener>,
}

impl BoundServer {
    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_addr
    }

    pub fn vhost_addr(&self) -> Option<SocketAddr> {
        self.vhost_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn handler(&self) -> Arc<ControlHandler> {
        self.handler.clone()
    }

    /// Serve until `shutdown` is cancelled, then close every session
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let BoundServer {
            handler,
            agent_listener,
            agent_addr,
            vhost_listener,
        } = self;

        info!("Accepting agents on {}", agent_addr);
        let vhost_task = vhost_listener.map(|listener| {
            if let Ok(addr) = listener.local_addr() {
                info!("HTTP vhost listening on {}", addr);
            }
            tokio::spawn(vhost::serve(listener, handler.clone()))
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = agent_listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let _ = socket.set_nodelay(true);
                        tokio::spawn(handler.clone().handle_connection(socket, peer_addr.to_string()));
                    }
                    Err(e) => {
                        error!("Failed to accept agent connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        info!("Shutting down relay");
        if let Some(task) = vhost_task {
            task.abort();
        }
        handler.shutdown().await;
        Ok(())
    }
}
