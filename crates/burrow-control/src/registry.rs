//! Proxy registry
//!
//! Maps proxy name to its declaration, public binding and owning session.
//! Every mutation goes through [`ProxyRegistry`]; the registry lock is always
//! taken before the router's.

use crate::config::ServerConfig;
use crate::error::ControlError;
use crate::port_allocator::{PortAllocator, RangePortAllocator};
use burrow_proto::{HttpProxyOptions, ProxyConfig, ProxyKind};
use burrow_router::{normalize_domain, VhostRouter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Public side of a registered proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Binding {
    Tcp { port: u16 },
    Http {
        domains: Vec<String>,
        locations: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub config: ProxyConfig,
    pub session_id: String,
    pub binding: Binding,
}

/// Registered proxy, for snapshots
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub name: String,
    pub proxy_type: String,
    pub session_id: String,
    pub local_addr: String,
    pub binding: Binding,
}

#[derive(Default)]
struct RegistryInner {
    proxies: HashMap<String, ProxyEntry>,
    ports: HashMap<u16, String>,
}

pub struct ProxyRegistry {
    inner: RwLock<RegistryInner>,
    /// Present when a vhost HTTP port is configured
    router: Option<Arc<VhostRouter>>,
    allocator: Arc<dyn PortAllocator>,
    subdomain_host: Option<String>,
}

impl ProxyRegistry {
    pub fn new(
        router: Option<Arc<VhostRouter>>,
        allocator: Arc<dyn PortAllocator>,
        subdomain_host: Option<String>,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            router,
            allocator,
            subdomain_host: subdomain_host.and_then(|h| normalize_domain(&h)),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let router = config
            .vhost_http_port
            .map(|_| Arc::new(VhostRouter::new()));
        Self::new(
            router,
            Arc::new(RangePortAllocator::new(config.allowed_ports.clone())),
            config.subdomain_host.clone(),
        )
    }

    pub fn router(&self) -> Option<&Arc<VhostRouter>> {
        self.router.as_ref()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and bind a proxy for `session_id`
    ///
    /// Nothing is changed when an error is returned.
    pub fn add(&self, config: ProxyConfig, session_id: &str) -> Result<Binding, ControlError> {
        validate_name(&config.name)?;

        let mut inner = self.write();
        if let Some(existing) = inner.proxies.get(&config.name) {
            return Err(ControlError::Conflict(format!(
                "proxy name {:?} is already registered by session {}",
                config.name, existing.session_id
            )));
        }

        let binding = match &config.kind {
            ProxyKind::Tcp { remote_port } => {
                let requested = (*remote_port != 0).then_some(*remote_port);
                let port = self.allocator.allocate(&config.name, requested)?;
                inner.ports.insert(port, config.name.clone());
                Binding::Tcp { port }
            }
            ProxyKind::Http(options) => {
                let router = self.router.as_ref().ok_or_else(|| {
                    ControlError::Validation(
                        "http proxies need the relay's vhost HTTP port".to_string(),
                    )
                })?;
                let domains = self.http_domains(options)?;
                let locations = options.effective_locations();
                router.register_all(&domains, &locations, &config.name)?;
                Binding::Http { domains, locations }
            }
        };

        info!(
            proxy = %config.name,
            session_id = %session_id,
            "Proxy registered: {:?}", binding
        );

        inner.proxies.insert(
            config.name.clone(),
            ProxyEntry {
                config,
                session_id: session_id.to_string(),
                binding: binding.clone(),
            },
        );
        Ok(binding)
    }

    /// Unbind a proxy, releasing its port or routes before returning
    pub fn remove(&self, name: &str) -> Option<ProxyEntry> {
        let mut inner = self.write();
        let entry = inner.proxies.remove(name)?;
        self.release(&mut inner, &entry);
        Some(entry)
    }

    /// Remove a proxy on behalf of `session_id`
    ///
    /// Unknown names are not an error; a proxy owned by another session is.
    pub fn remove_owned(
        &self,
        name: &str,
        session_id: &str,
    ) -> Result<Option<ProxyEntry>, ControlError> {
        let mut inner = self.write();
        match inner.proxies.get(name) {
            None => return Ok(None),
            Some(entry) if entry.session_id != session_id => {
                return Err(ControlError::Validation(format!(
                    "proxy {:?} belongs to another session",
                    name
                )));
            }
            Some(_) => {}
        }

        let entry = inner.proxies.remove(name);
        if let Some(entry) = &entry {
            self.release(&mut inner, entry);
        }
        Ok(entry)
    }

    fn release(&self, inner: &mut RegistryInner, entry: &ProxyEntry) {
        match &entry.binding {
            Binding::Tcp { port } => {
                inner.ports.remove(port);
                self.allocator.deallocate(&entry.config.name);
            }
            Binding::Http { .. } => {
                if let Some(router) = &self.router {
                    router.unregister_proxy(&entry.config.name);
                }
            }
        }
        debug!(proxy = %entry.config.name, "Proxy unbound");
    }

    pub fn lookup(&self, name: &str) -> Option<(ProxyConfig, String)> {
        self.read()
            .proxies
            .get(name)
            .map(|entry| (entry.config.clone(), entry.session_id.clone()))
    }

    pub fn lookup_by_port(&self, port: u16) -> Option<String> {
        self.read().ports.get(&port).cloned()
    }

    pub fn binding(&self, name: &str) -> Option<Binding> {
        self.read().proxies.get(name).map(|e| e.binding.clone())
    }

    pub fn proxies_of(&self, session_id: &str) -> Vec<String> {
        self.read()
            .proxies
            .values()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.config.name.clone())
            .collect()
    }

    pub fn proxies(&self) -> Vec<ProxyInfo> {
        let mut proxies: Vec<ProxyInfo> = self
            .read()
            .proxies
            .values()
            .map(|e| ProxyInfo {
                name: e.config.name.clone(),
                proxy_type: e.config.proxy_type().to_string(),
                session_id: e.session_id.clone(),
                local_addr: e.config.local_addr(),
                binding: e.binding.clone(),
            })
            .collect();
        proxies.sort_by(|a, b| a.name.cmp(&b.name));
        proxies
    }

    pub fn len(&self) -> usize {
        self.read().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn http_domains(&self, options: &HttpProxyOptions) -> Result<Vec<String>, ControlError> {
        let mut domains: Vec<String> = Vec::new();

        for raw in &options.custom_domains {
            let domain = normalize_domain(raw).ok_or_else(|| {
                ControlError::Validation(format!("invalid custom domain {:?}", raw))
            })?;
            if let Some(host) = &self.subdomain_host {
                if domain == *host || domain.ends_with(&format!(".{}", host)) {
                    return Err(ControlError::Validation(format!(
                        "custom domain {} falls under the reserved subdomain host {}",
                        domain, host
                    )));
                }
            }
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        if let Some(subdomain) = &options.subdomain {
            let host = self.subdomain_host.as_ref().ok_or_else(|| {
                ControlError::Validation("subdomain needs the relay's subdomain_host".to_string())
            })?;
            let subdomain = subdomain.trim().to_ascii_lowercase();
            if subdomain.is_empty() || subdomain.contains(['.', '*', ':', '/']) {
                return Err(ControlError::Validation(format!(
                    "invalid subdomain {:?}",
                    subdomain
                )));
            }
            let domain = format!("{}.{}", subdomain, host);
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        if domains.is_empty() {
            return Err(ControlError::Validation(
                "http proxy needs a custom domain or a subdomain".to_string(),
            ));
        }
        Ok(domains)
    }
}

fn validate_name(name: &str) -> Result<(), ControlError> {
    if name.is_empty() {
        return Err(ControlError::Validation("proxy name is empty".to_string()));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ControlError::Validation(format!(
            "proxy name {:?} contains whitespace",
            name
        )));
    }
    Ok(())
}
