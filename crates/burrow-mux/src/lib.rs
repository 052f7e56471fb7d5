//! Stream multiplexer
//!
//! Carries many independent, flow-controlled byte streams over one
//! `AsyncRead + AsyncWrite` connection. Stream 0 is reserved for the control
//! channel and is open on both ends as soon as the multiplexer exists.
//!
//! ```no_run
//! # async fn demo(io: tokio::net::TcpStream) -> Result<(), burrow_mux::MuxError> {
//! use tokio::io::AsyncWriteExt;
//!
//! let mux = burrow_mux::Multiplexer::client(io);
//! let mut stream = mux.open_stream()?;
//! stream.write_all(b"hello").await?;
//! stream.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod multiplexer;
mod splice;
mod stream;

pub use error::MuxError;
pub use multiplexer::{MuxConfig, Multiplexer, Role};
pub use splice::{splice, SpliceStats};
pub use stream::MuxStream;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, ignoring poisoning; no invariant spans a panic here
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
