//! Relay control plane
//!
//! Accepts agent connections, authenticates them, keeps one [`Session`] per
//! agent and maintains the proxy registry and vhost routes their proxies
//! declare. Listeners ask the [`ControlHandler`] for work connections to
//! serve inbound traffic.

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod pending_work;
pub mod port_allocator;
pub mod registry;
pub mod session;
pub mod task_tracker;

pub use config::{PortRange, ServerConfig};
pub use error::ControlError;
pub use events::{ServerSnapshot, SessionEvent};
pub use handler::{ControlHandler, LoginRequest, TcpProxySpawner, WorkConn};
pub use pending_work::PendingWork;
pub use port_allocator::{PortAllocator, PortError, RangePortAllocator};
pub use registry::{Binding, ProxyEntry, ProxyInfo, ProxyRegistry};
pub use session::{HeartbeatClock, Session, SessionInfo, SessionState};
pub use task_tracker::TaskTracker;
