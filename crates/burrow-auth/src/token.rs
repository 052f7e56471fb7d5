//! Shared-token authentication with timestamped privilege keys

use crate::verifier::{AuthError, AuthResult, Credentials, TokenVerifier};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

/// `base64(sha256(token || timestamp))`
///
/// The token itself never crosses the wire.
pub fn privilege_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Verifies privilege keys derived from one shared token
#[derive(Debug, Clone)]
pub struct StaticTokenVerifier {
    token: String,
    /// Maximum accepted difference between agent and relay clocks, in seconds;
    /// 0 disables the check
    max_skew_secs: i64,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            max_skew_secs: 15 * 60,
        }
    }

    pub fn with_max_skew(mut self, secs: i64) -> Self {
        self.max_skew_secs = secs;
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<AuthResult, AuthError> {
        if credentials.privilege_key.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        if self.max_skew_secs > 0 {
            let skew = (Utc::now().timestamp() - credentials.timestamp).abs();
            if skew > self.max_skew_secs {
                debug!(run_id = %credentials.run_id, skew, "Login timestamp rejected");
                return Err(AuthError::ClockSkew(self.max_skew_secs));
            }
        }

        let expected = privilege_key(&self.token, credentials.timestamp);
        let matches: bool = expected
            .as_bytes()
            .ct_eq(credentials.privilege_key.as_bytes())
            .into();
        if !matches {
            return Err(AuthError::InvalidToken);
        }

        Ok(AuthResult::new(credentials.run_id.clone()))
    }
}
