//! Protocol message types

use serde::{Deserialize, Serialize};

/// Messages carried on the control stream and at the head of work streams
///
/// Control stream (stream 0): `Login`, `LoginResp`, `NewProxy`, `NewProxyResp`,
/// `CloseProxy`, `NewWorkConn`, `Ping`, `Pong`, `Logout`.
///
/// Work streams (opened by the agent): the agent writes `WorkConnReady` first,
/// the relay answers with `StartWorkConn` and both sides then switch to raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    Login {
        version: u32,
        /// Agent identity; empty on first connect, reused on reconnect
        run_id: String,
        privilege_key: String,
        timestamp: i64,
        pool_count: u32,
        metadata: AgentMetadata,
    },
    LoginResp {
        version: u32,
        run_id: String,
        session_id: String,
        error: Option<String>,
    },

    NewProxy {
        config: ProxyConfig,
    },
    NewProxyResp {
        name: String,
        remote_addr: String,
        error: Option<String>,
    },
    CloseProxy {
        name: String,
    },

    /// Relay asks the agent to open a work stream.
    /// `None` refills the idle pool, `Some(id)` answers one waiting connection.
    NewWorkConn {
        correlation_id: Option<u64>,
    },

    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Logout {
        reason: String,
    },

    // Work stream handshake
    WorkConnReady {
        run_id: String,
        correlation_id: Option<u64>,
    },
    StartWorkConn {
        proxy_name: String,
        src_addr: String,
        dst_port: u16,
    },
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login { .. } => "Login",
            Message::LoginResp { .. } => "LoginResp",
            Message::NewProxy { .. } => "NewProxy",
            Message::NewProxyResp { .. } => "NewProxyResp",
            Message::CloseProxy { .. } => "CloseProxy",
            Message::NewWorkConn { .. } => "NewWorkConn",
            Message::Ping { .. } => "Ping",
            Message::Pong { .. } => "Pong",
            Message::Logout { .. } => "Logout",
            Message::WorkConnReady { .. } => "WorkConnReady",
            Message::StartWorkConn { .. } => "StartWorkConn",
        }
    }
}

/// Declared proxy, one per exposed local service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub name: String,
    /// Local service address, only meaningful to the agent
    pub local_ip: String,
    pub local_port: u16,
    pub kind: ProxyKind,
}

impl ProxyConfig {
    pub fn tcp(name: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            name: name.into(),
            local_ip: "127.0.0.1".to_string(),
            local_port,
            kind: ProxyKind::Tcp { remote_port },
        }
    }

    pub fn http(name: impl Into<String>, local_port: u16, options: HttpProxyOptions) -> Self {
        Self {
            name: name.into(),
            local_ip: "127.0.0.1".to_string(),
            local_port,
            kind: ProxyKind::Http(options),
        }
    }

    pub fn proxy_type(&self) -> &'static str {
        match self.kind {
            ProxyKind::Tcp { .. } => "tcp",
            ProxyKind::Http(_) => "http",
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }
}

/// Service-type specific part of a proxy declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProxyKind {
    /// Raw TCP on a dedicated public port; 0 asks the relay to allocate one
    Tcp { remote_port: u16 },
    /// HTTP on the shared vhost port, routed by host and path
    Http(HttpProxyOptions),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProxyOptions {
    pub custom_domains: Vec<String>,
    /// Prefix joined with the relay's subdomain host
    pub subdomain: Option<String>,
    /// Path prefixes; empty means `/`
    pub locations: Vec<String>,
    pub http_user: Option<String>,
    pub http_pwd: Option<String>,
}

impl HttpProxyOptions {
    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            custom_domains: domains.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, pwd: impl Into<String>) -> Self {
        self.http_user = Some(user.into());
        self.http_pwd = Some(pwd.into());
        self
    }

    /// Locations with the `/` default applied
    pub fn effective_locations(&self) -> Vec<String> {
        if self.locations.is_empty() {
            vec!["/".to_string()]
        } else {
            self.locations.clone()
        }
    }
}

/// Agent metadata for identification and monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String, // e.g., "linux", "macos", "windows"
    pub version: String,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
