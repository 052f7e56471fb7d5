//! Virtual host routing for HTTP proxies
//!
//! Routes are keyed by (domain, location). A request is matched by its
//! normalized `Host` and the longest registered location that prefixes its
//! path, with `/` acting as the fallback. Wildcard domains (`*.example.com`)
//! are consulted when the exact domain has no matching location.

pub mod host;
pub mod vhost;
pub mod wildcard;

pub use host::{normalize_domain, normalize_host};
pub use vhost::{RouteInfo, RouteMatch, RouterError, VhostRouter};
pub use wildcard::{parent_wildcards, validate_wildcard, WildcardError};
