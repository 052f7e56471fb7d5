use burrow_proto::{FrameError, StreamId};
use std::io;
use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Transport closed")]
    TransportClosed,

    #[error("Stream reset: {0}")]
    StreamReset(StreamId),

    #[error("Peer exceeded flow control window on stream {0}")]
    WindowExceeded(StreamId),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("No available stream IDs")]
    StreamIdsExhausted,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::StreamReset(_) => io::ErrorKind::ConnectionReset,
            MuxError::TransportClosed => io::ErrorKind::BrokenPipe,
            MuxError::Io(e) => e.kind(),
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
