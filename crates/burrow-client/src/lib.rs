//! Burrow agent
//!
//! Dials the relay, logs in, registers the configured proxies and answers
//! work-connection requests by splicing relay streams to local services.

pub mod agent;
pub mod config;
pub mod error;

pub use agent::{backoff_delay, Agent, AgentEvent, AgentSession};
pub use config::{AgentConfig, ProxyDef};
pub use error::AgentError;
