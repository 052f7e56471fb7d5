//! JWT (JSON Web Token) login verification

use crate::verifier::{AuthError, AuthResult, Credentials, TokenVerifier};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims carried in the agent's privilege key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwtClaims {
    /// Subject (agent identity)
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

impl JwtClaims {
    pub fn new(subject: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject.into(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// HS256 JWT verifier
///
/// Validates the signature and expiration only; issuer and audience are not
/// checked.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.is_expired() {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }

    /// Sign claims with HS256
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, AuthError> {
        let header = Header::new(Algorithm::HS256);
        Ok(encode(&header, claims, &EncodingKey::from_secret(secret))?)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<AuthResult, AuthError> {
        if credentials.privilege_key.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let claims = self.validate(&credentials.privilege_key)?;
        Ok(AuthResult::new(claims.sub))
    }
}
