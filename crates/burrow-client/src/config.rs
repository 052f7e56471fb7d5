//! Agent configuration

use burrow_proto::{HttpProxyOptions, ProxyConfig, ProxyKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::AgentError;

/// Agent configuration, usually loaded from a YAML file
///
/// ```yaml
/// server_addr: relay.example.com:7000
/// token: secret
/// pool_count: 2
/// proxies:
///   - type: tcp
///     name: ssh
///     local_port: 22
///     remote_port: 6000
///   - type: http
///     name: web
///     local_port: 8080
///     custom_domains: [www.example.com]
///     locations: [/, /api]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_addr: String,

    /// Shared token; `None` logs in with an empty privilege key
    #[serde(default)]
    pub token: Option<String>,

    /// Identity to resume; empty lets the relay assign one
    #[serde(default)]
    pub run_id: String,

    /// Work connections kept open ahead of demand
    #[serde(default)]
    pub pool_count: u32,

    #[serde(default = "default_heartbeat_interval", with = "duration_secs")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_heartbeat_timeout", with = "duration_secs")]
    pub heartbeat_timeout: Duration,

    /// Budget for dialing the relay and for dialing local services
    #[serde(default = "default_dial_timeout", with = "duration_secs")]
    pub dial_timeout: Duration,

    #[serde(default)]
    pub proxies: Vec<ProxyDef>,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_string(),
            token: None,
            run_id: String::new(),
            pool_count: 0,
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            dial_timeout: default_dial_timeout(),
            proxies: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_pool_count(mut self, pool_count: u32) -> Self {
        self.pool_count = pool_count;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyDef) -> Self {
        self.proxies.push(proxy);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, AgentError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject configs the relay would refuse anyway
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.server_addr.is_empty() {
            return Err(AgentError::Config("server_addr is empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(AgentError::Config(
                "heartbeat_interval must be positive".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for proxy in &self.proxies {
            if proxy.name().is_empty() {
                return Err(AgentError::Config("proxy without a name".to_string()));
            }
            if !names.insert(proxy.name()) {
                return Err(AgentError::Config(format!(
                    "duplicate proxy name '{}'",
                    proxy.name()
                )));
            }
        }
        Ok(())
    }

    pub fn proxy_configs(&self) -> Vec<ProxyConfig> {
        self.proxies.iter().map(ProxyDef::to_proxy_config).collect()
    }
}

/// One `proxies:` entry in the agent config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyDef {
    Tcp {
        name: String,
        #[serde(default = "default_local_ip")]
        local_ip: String,
        local_port: u16,
        /// 0 lets the relay pick
        #[serde(default)]
        remote_port: u16,
    },
    Http {
        name: String,
        #[serde(default = "default_local_ip")]
        local_ip: String,
        local_port: u16,
        #[serde(default)]
        custom_domains: Vec<String>,
        #[serde(default)]
        subdomain: Option<String>,
        #[serde(default)]
        locations: Vec<String>,
        #[serde(default)]
        http_user: Option<String>,
        #[serde(default)]
        http_pwd: Option<String>,
    },
}

impl ProxyDef {
    pub fn name(&self) -> &str {
        match self {
            ProxyDef::Tcp { name, .. } | ProxyDef::Http { name, .. } => name,
        }
    }

    pub fn to_proxy_config(&self) -> ProxyConfig {
        match self {
            ProxyDef::Tcp {
                name,
                local_ip,
                local_port,
                remote_port,
            } => ProxyConfig {
                name: name.clone(),
                local_ip: local_ip.clone(),
                local_port: *local_port,
                kind: ProxyKind::Tcp {
                    remote_port: *remote_port,
                },
            },
            ProxyDef::Http {
                name,
                local_ip,
                local_port,
                custom_domains,
                subdomain,
                locations,
                http_user,
                http_pwd,
            } => ProxyConfig {
                name: name.clone(),
                local_ip: local_ip.clone(),
                local_port: *local_port,
                kind: ProxyKind::Http(HttpProxyOptions {
                    custom_domains: custom_domains.clone(),
                    subdomain: subdomain.clone(),
                    locations: locations.clone(),
                    http_user: http_user.clone(),
                    http_pwd: http_pwd.clone(),
                }),
            },
        }
    }
}
