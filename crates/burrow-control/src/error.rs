//! Control plane errors

use crate::port_allocator::PortError;
use burrow_auth::AuthError;
use burrow_mux::MuxError;
use burrow_proto::CodecError;
use burrow_router::RouterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid proxy configuration: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No route: {0}")]
    RouteMiss(String),

    #[error("Agent did not supply a work connection for {proxy} in time")]
    WorkTimeout { proxy: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl ControlError {
    /// Whether the error ends the session it occurred on
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::Transport(_))
    }
}

impl From<RouterError> for ControlError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Conflict { .. } => ControlError::Conflict(err.to_string()),
            RouterError::NoMatch { .. } | RouterError::NotFound { .. } => {
                ControlError::RouteMiss(err.to_string())
            }
            RouterError::InvalidDomain(_)
            | RouterError::InvalidWildcard(_)
            | RouterError::InvalidLocation(_) => ControlError::Validation(err.to_string()),
        }
    }
}

impl From<PortError> for ControlError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::InUse(_) => ControlError::Conflict(err.to_string()),
            PortError::NotAllowed(_) | PortError::Exhausted => {
                ControlError::Validation(err.to_string())
            }
        }
    }
}

impl From<CodecError> for ControlError {
    fn from(err: CodecError) -> Self {
        ControlError::Transport(err.to_string())
    }
}

impl From<MuxError> for ControlError {
    fn from(err: MuxError) -> Self {
        ControlError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Transport(err.to_string())
    }
}
