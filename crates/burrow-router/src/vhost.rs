//! Host + path prefix route table

use crate::host::{normalize_domain, normalize_host};
use crate::wildcard::{parent_wildcards, validate_wildcard, WildcardError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, trace};

/// Router errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Invalid wildcard domain: {0}")]
    InvalidWildcard(#[from] WildcardError),

    #[error("Invalid location {0:?}: must start with '/'")]
    InvalidLocation(String),

    #[error("Route {domain}{location} already belongs to proxy {existing}")]
    Conflict {
        domain: String,
        location: String,
        existing: String,
    },

    #[error("Route not found: {domain}{location}")]
    NotFound { domain: String, location: String },

    #[error("No route for host {host:?} path {path:?}")]
    NoMatch { host: String, path: String },
}

/// Result of a successful match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub proxy: String,
    /// Domain entry that matched; a wildcard pattern when matched by fallback
    pub domain: String,
    pub location: String,
}

/// One registered route, for snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub domain: String,
    pub location: String,
    pub proxy: String,
}

#[derive(Debug, Clone)]
struct LocationEntry {
    location: String,
    proxy: String,
}

/// Route table for one vhost port
///
/// Mutations take the write lock for their whole duration, so a proxy
/// registering several (domain, location) pairs is never partially visible.
#[derive(Debug, Default)]
pub struct VhostRouter {
    /// domain -> locations, kept longest first
    routes: RwLock<HashMap<String, Vec<LocationEntry>>>,
}

impl VhostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<LocationEntry>>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<LocationEntry>>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one (domain, location) pair for `proxy`
    pub fn register(&self, domain: &str, location: &str, proxy: &str) -> Result<(), RouterError> {
        self.register_all(&[domain.to_string()], &[location.to_string()], proxy)
    }

    /// Register every domain x location pair for `proxy`, or none of them
    pub fn register_all(
        &self,
        domains: &[String],
        locations: &[String],
        proxy: &str,
    ) -> Result<(), RouterError> {
        let domains = domains
            .iter()
            .map(|d| validate_domain(d))
            .collect::<Result<Vec<_>, _>>()?;
        for location in locations {
            validate_location(location)?;
        }

        let mut routes = self.write();

        // Check every pair (and duplicates within the request) before touching the table
        let mut pending: Vec<(&str, &str)> = Vec::new();
        for domain in &domains {
            for location in locations {
                if let Some(entry) = routes
                    .get(domain)
                    .and_then(|entries| entries.iter().find(|e| e.location == *location))
                {
                    return Err(RouterError::Conflict {
                        domain: domain.clone(),
                        location: location.clone(),
                        existing: entry.proxy.clone(),
                    });
                }
                if pending.contains(&(domain.as_str(), location.as_str())) {
                    return Err(RouterError::Conflict {
                        domain: domain.clone(),
                        location: location.clone(),
                        existing: proxy.to_string(),
                    });
                }
                pending.push((domain.as_str(), location.as_str()));
            }
        }

        for (domain, location) in pending {
            let entries = routes.entry(domain.to_string()).or_default();
            entries.push(LocationEntry {
                location: location.to_string(),
                proxy: proxy.to_string(),
            });
            entries.sort_by(|a, b| b.location.len().cmp(&a.location.len()));
            debug!("Registered route {}{} -> {}", domain, location, proxy);
        }

        Ok(())
    }

    /// Remove one (domain, location) pair, returning the proxy that owned it
    pub fn unregister(&self, domain: &str, location: &str) -> Result<String, RouterError> {
        let not_found = || RouterError::NotFound {
            domain: domain.to_string(),
            location: location.to_string(),
        };
        let key = normalize_domain(domain).ok_or_else(not_found)?;

        let mut routes = self.write();
        let entries = routes.get_mut(&key).ok_or_else(not_found)?;
        let index = entries
            .iter()
            .position(|e| e.location == location)
            .ok_or_else(not_found)?;
        let removed = entries.remove(index);
        if entries.is_empty() {
            routes.remove(&key);
        }

        debug!("Unregistered route {}{} (proxy {})", key, location, removed.proxy);
        Ok(removed.proxy)
    }

    /// Remove every route owned by `proxy`; returns how many were removed
    pub fn unregister_proxy(&self, proxy: &str) -> usize {
        let mut routes = self.write();
        let mut removed = 0;

        routes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.proxy != proxy);
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            debug!("Unregistered {} routes of proxy {}", removed, proxy);
        }
        removed
    }

    /// Resolve a request to its proxy
    ///
    /// The exact domain is tried first; if none of its locations prefix
    /// `path`, parent wildcard domains are tried from most to least specific.
    pub fn match_route(&self, host: &str, path: &str) -> Result<RouteMatch, RouterError> {
        let normalized = normalize_host(host);
        let no_match = || RouterError::NoMatch {
            host: host.to_string(),
            path: path.to_string(),
        };

        if normalized.is_empty() || normalized.contains('*') {
            return Err(no_match());
        }

        let routes = self.read();

        if let Some(found) = longest_prefix(&routes, &normalized, path) {
            trace!("Matched {}{} -> {}", normalized, path, found.proxy);
            return Ok(found);
        }

        for pattern in parent_wildcards(&normalized) {
            if let Some(found) = longest_prefix(&routes, &pattern, path) {
                trace!("Matched {}{} via {} -> {}", normalized, path, pattern, found.proxy);
                return Ok(found);
            }
        }

        Err(no_match())
    }

    /// All routes, sorted by domain then longest location first
    pub fn routes(&self) -> Vec<RouteInfo> {
        let routes = self.read();
        let mut infos: Vec<RouteInfo> = routes
            .iter()
            .flat_map(|(domain, entries)| {
                entries.iter().map(move |e| RouteInfo {
                    domain: domain.clone(),
                    location: e.location.clone(),
                    proxy: e.proxy.clone(),
                })
            })
            .collect();
        infos.sort_by(|a, b| {
            a.domain
                .cmp(&b.domain)
                .then(b.location.len().cmp(&a.location.len()))
        });
        infos
    }

    pub fn route_count(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn longest_prefix(
    routes: &HashMap<String, Vec<LocationEntry>>,
    domain: &str,
    path: &str,
) -> Option<RouteMatch> {
    // Entries are sorted longest first, so the first prefix wins
    routes.get(domain)?.iter().find_map(|e| {
        path.starts_with(&e.location).then(|| RouteMatch {
            proxy: e.proxy.clone(),
            domain: domain.to_string(),
            location: e.location.clone(),
        })
    })
}

fn validate_domain(domain: &str) -> Result<String, RouterError> {
    let normalized =
        normalize_domain(domain).ok_or_else(|| RouterError::InvalidDomain(domain.to_string()))?;

    if normalized.contains('*') {
        validate_wildcard(&normalized)?;
    }
    Ok(normalized)
}

fn validate_location(location: &str) -> Result<(), RouterError> {
    if !location.starts_with('/') || location.chars().any(char::is_whitespace) {
        return Err(RouterError::InvalidLocation(location.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_foo_bar() -> VhostRouter {
        let router = VhostRouter::new();
        router
            .register_all(
                &["normal.example.com".to_string()],
                &["/".to_string(), "/foo".to_string()],
                "foo",
            )
            .unwrap();
        router
            .register("normal.example.com", "/bar", "bar")
            .unwrap();
        router
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = router_with_foo_bar();

        assert_eq!(router.match_route("normal.example.com", "/foo").unwrap().proxy, "foo");
        assert_eq!(router.match_route("normal.example.com", "/bar").unwrap().proxy, "bar");
        assert_eq!(router.match_route("normal.example.com", "/bar/baz").unwrap().proxy, "bar");
        assert_eq!(router.match_route("normal.example.com", "/foo/x").unwrap().location, "/foo");
    }

    #[test]
    fn test_root_is_fallback() {
        let router = router_with_foo_bar();

        let found = router.match_route("normal.example.com", "/other").unwrap();
        assert_eq!(found.proxy, "foo");
        assert_eq!(found.location, "/");
    }

    #[test]
    fn test_miss_without_fallback() {
        let router = VhostRouter::new();
        router.register("api.example.com", "/v1", "api").unwrap();

        assert!(matches!(
            router.match_route("api.example.com", "/v2"),
            Err(RouterError::NoMatch { .. })
        ));
        assert!(matches!(
            router.match_route("unknown.example.com", "/v1"),
            Err(RouterError::NoMatch { .. })
        ));
    }

    #[test]
    fn test_host_is_normalized() {
        let router = router_with_foo_bar();

        assert_eq!(
            router.match_route("Normal.Example.COM:8080", "/bar").unwrap().proxy,
            "bar"
        );
        assert_eq!(
            router.match_route("normal.example.com.", "/").unwrap().proxy,
            "foo"
        );
    }

    #[test]
    fn test_duplicate_location_conflicts() {
        let router = router_with_foo_bar();

        let err = router
            .register("normal.example.com", "/bar", "other")
            .unwrap_err();
        assert_eq!(
            err,
            RouterError::Conflict {
                domain: "normal.example.com".to_string(),
                location: "/bar".to_string(),
                existing: "bar".to_string(),
            }
        );

        // Original owner keeps the route
        assert_eq!(router.match_route("normal.example.com", "/bar").unwrap().proxy, "bar");
    }

    #[test]
    fn test_register_all_is_atomic() {
        let router = router_with_foo_bar();

        let result = router.register_all(
            &["normal.example.com".to_string()],
            &["/baz".to_string(), "/bar".to_string()],
            "baz",
        );
        assert!(matches!(result, Err(RouterError::Conflict { .. })));

        // "/baz" must not have been registered
        assert_eq!(router.match_route("normal.example.com", "/baz").unwrap().proxy, "foo");
        assert_eq!(router.route_count(), 3);
    }

    #[test]
    fn test_register_all_rejects_repeated_pairs() {
        let router = VhostRouter::new();
        let result = router.register_all(
            &["a.example.com".to_string(), "A.example.com".to_string()],
            &["/".to_string()],
            "p",
        );
        assert!(matches!(result, Err(RouterError::Conflict { .. })));
        assert!(router.is_empty());
    }

    #[test]
    fn test_invalid_inputs() {
        let router = VhostRouter::new();

        assert!(matches!(
            router.register("example.com", "foo", "p"),
            Err(RouterError::InvalidLocation(_))
        ));
        assert!(matches!(
            router.register("", "/", "p"),
            Err(RouterError::InvalidDomain(_))
        ));
        assert!(matches!(
            router.register("api.*.example.com", "/", "p"),
            Err(RouterError::InvalidWildcard(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let router = router_with_foo_bar();

        assert_eq!(router.unregister("normal.example.com", "/bar").unwrap(), "bar");
        assert_eq!(router.match_route("normal.example.com", "/bar").unwrap().proxy, "foo");
        assert!(matches!(
            router.unregister("normal.example.com", "/bar"),
            Err(RouterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_unregister_proxy_removes_all_routes() {
        let router = router_with_foo_bar();

        assert_eq!(router.unregister_proxy("foo"), 2);
        assert!(router.match_route("normal.example.com", "/other").is_err());
        assert_eq!(router.match_route("normal.example.com", "/bar").unwrap().proxy, "bar");

        assert_eq!(router.unregister_proxy("foo"), 0);
    }

    #[test]
    fn test_wildcard_fallback() {
        let router = VhostRouter::new();
        router.register("*.example.com", "/", "catch-all").unwrap();
        router.register("*.api.example.com", "/", "api").unwrap();
        router.register("www.example.com", "/static", "static").unwrap();

        assert_eq!(router.match_route("blog.example.com", "/").unwrap().proxy, "catch-all");
        assert_eq!(router.match_route("v1.api.example.com", "/x").unwrap().proxy, "api");
        assert_eq!(
            router.match_route("deep.v1.api.example.com", "/x").unwrap().proxy,
            "api"
        );

        // Exact domain wins when one of its locations matches
        assert_eq!(router.match_route("www.example.com", "/static/a.css").unwrap().proxy, "static");
        // ...and falls through to the wildcard otherwise
        let found = router.match_route("www.example.com", "/index.html").unwrap();
        assert_eq!(found.proxy, "catch-all");
        assert_eq!(found.domain, "*.example.com");

        // The base domain itself is not covered
        assert!(router.match_route("example.com", "/").is_err());
    }

    #[test]
    fn test_routes_snapshot() {
        let router = router_with_foo_bar();
        let routes = router.routes();

        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].location.len(), 4);
        assert_eq!(routes[2].location, "/");
        assert_eq!(routes[2].proxy, "foo");
    }
}
