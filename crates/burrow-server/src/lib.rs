//! Burrow relay
//!
//! Public listeners in front of the control plane: one shared HTTP vhost
//! port, one dedicated port per tcp proxy, and the port agents dial.

pub mod error;
mod exchange;
pub mod server;
pub mod tcp_proxy;
pub mod vhost;

pub use error::ServerError;
pub use server::{BoundServer, Server};
pub use tcp_proxy::{bind_with_retry, tcp_proxy_spawner};
