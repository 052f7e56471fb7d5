//! Wildcard domain patterns
//!
//! Only a leading `*.` is accepted (e.g. `*.example.com`). A pattern covers
//! every name below its base domain, at any depth; the router prefers the most
//! specific pattern by walking parents from the host upward.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WildcardError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Bare asterisk (*) is not a valid pattern")]
    BareAsterisk,

    #[error("Wildcard must be the leftmost label: {0}")]
    MisplacedWildcard(String),

    #[error("Pattern must have at least two domain parts after the wildcard")]
    InsufficientDomainParts,

    #[error("Domain parts cannot be empty: {0}")]
    EmptyLabel(String),
}

/// Check that `pattern` is a usable wildcard domain
///
/// ```
/// use burrow_router::validate_wildcard;
///
/// assert!(validate_wildcard("*.example.com").is_ok());
/// assert!(validate_wildcard("api.*.example.com").is_err());
/// ```
pub fn validate_wildcard(pattern: &str) -> Result<(), WildcardError> {
    if pattern.is_empty() {
        return Err(WildcardError::EmptyPattern);
    }
    if pattern == "*" {
        return Err(WildcardError::BareAsterisk);
    }

    let base_domain = pattern
        .strip_prefix("*.")
        .ok_or_else(|| WildcardError::MisplacedWildcard(pattern.to_string()))?;

    if base_domain.contains('*') {
        return Err(WildcardError::MisplacedWildcard(pattern.to_string()));
    }
    if !base_domain.contains('.') {
        return Err(WildcardError::InsufficientDomainParts);
    }
    if base_domain.split('.').any(str::is_empty) {
        return Err(WildcardError::EmptyLabel(pattern.to_string()));
    }
    Ok(())
}

/// Wildcard patterns covering `hostname`, most specific first
///
/// ```
/// use burrow_router::parent_wildcards;
///
/// assert_eq!(
///     parent_wildcards("a.b.example.com"),
///     vec!["*.b.example.com".to_string(), "*.example.com".to_string()]
/// );
/// assert!(parent_wildcards("example.com").is_empty());
/// ```
pub fn parent_wildcards(hostname: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut rest = hostname;

    while let Some(dot) = rest.find('.') {
        let parent = &rest[dot + 1..];
        // Never produce a pattern over a bare TLD
        if !parent.contains('.') {
            break;
        }
        patterns.push(format!("*.{}", parent));
        rest = parent;
    }

    patterns
}
