use burrow_mux::MuxError;
use burrow_proto::CodecError;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid agent configuration: {0}")]
    Config(String),

    #[error("Failed to connect to relay {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No pong from relay within {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("Relay closed the control connection")]
    Disconnected,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Errors that reconnecting cannot fix
    pub fn is_permanent(&self) -> bool {
        matches!(self, AgentError::Config(_) | AgentError::LoginRejected(_))
    }
}
