//! Session authentication for burrow agents
//!
//! The relay hands every `Login` to a [`TokenVerifier`]. Three strategies ship
//! with the crate: a shared token proven through a timestamped privilege key,
//! HS256 JWTs, and an allow-all verifier for development.

pub mod jwt;
pub mod token;
pub mod verifier;

pub use jwt::{JwtClaims, JwtVerifier};
pub use token::{privilege_key, StaticTokenVerifier};
pub use verifier::{AllowAll, AuthError, AuthResult, Credentials, TokenVerifier};

pub use async_trait::async_trait;
