//! Session lifecycle events and read-only snapshots

use crate::registry::ProxyInfo;
use crate::session::SessionInfo;
use burrow_router::RouteInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle notifications, broadcast to any number of subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        session_id: String,
        run_id: String,
        peer_addr: String,
    },
    Disconnected {
        session_id: String,
        run_id: String,
        reason: String,
    },
    ProxyBound {
        session_id: String,
        proxy: String,
        remote_addr: String,
    },
    ProxyUnbound {
        session_id: String,
        proxy: String,
    },
    WorkConnTimeout {
        session_id: String,
        proxy: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Connected { session_id, .. }
            | SessionEvent::Disconnected { session_id, .. }
            | SessionEvent::ProxyBound { session_id, .. }
            | SessionEvent::ProxyUnbound { session_id, .. }
            | SessionEvent::WorkConnTimeout { session_id, .. } => session_id,
        }
    }
}

/// Point-in-time view of the relay
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub generated_at: DateTime<Utc>,
    pub sessions: Vec<SessionInfo>,
    pub proxies: Vec<ProxyInfo>,
    pub routes: Vec<RouteInfo>,
}
