//! Host name normalization

/// Normalize a `Host` header value for route lookup
///
/// Strips a port suffix (bracketed IPv6 literals keep their brackets),
/// lowercases, and removes a trailing dot.
///
/// ```
/// use burrow_router::normalize_host;
///
/// assert_eq!(normalize_host("Normal.Example.com:8080"), "normal.example.com");
/// assert_eq!(normalize_host("[::1]:80"), "[::1]");
/// assert_eq!(normalize_host("example.com."), "example.com");
/// ```
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        // Bare IPv6 address or no port at all
        host
    };

    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize a domain declared by a proxy; `None` if it cannot be routed
pub fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !domain.is_empty()
        && !domain
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '/' | '?' | '#'));
    valid.then_some(domain)
}
