//! Verifier trait for pluggable login authentication

use async_trait::async_trait;
use thiserror::Error;

/// What an agent presents at login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub run_id: String,
    /// Proof of the shared secret, or a bearer token, depending on the verifier
    pub privilege_key: String,
    /// Unix seconds on the agent's clock when the key was computed
    pub timestamp: i64,
}

/// Identity established by a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub subject: String,
}

impl AuthResult {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Timestamp outside allowed skew ({0}s)")]
    ClockSkew(i64),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Verifies login credentials
///
/// Implementations must be cheap to share; the relay keeps one behind an `Arc`
/// and calls it from every login concurrently.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, credentials: &Credentials) -> Result<AuthResult, AuthError>;
}

/// Accepts every login; for tests and local development only
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl TokenVerifier for AllowAll {
    async fn verify(&self, credentials: &Credentials) -> Result<AuthResult, AuthError> {
        Ok(AuthResult::new(credentials.run_id.clone()))
    }
}
