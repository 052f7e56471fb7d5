//! Correlation table for requested work connections
//!
//! The relay sends `NewWorkConn{correlation_id}` and parks a receiver here;
//! the stream the agent opens in reply carries the same id in its
//! `WorkConnReady` and is routed back to the waiting connection.

use burrow_mux::MuxStream;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks inbound connections waiting for a work stream
#[derive(Clone, Default)]
pub struct PendingWork {
    waiters: Arc<DashMap<u64, oneshot::Sender<MuxStream>>>,
    next_id: Arc<AtomicU64>,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id and a receiver for its stream
    pub fn register(&self) -> (u64, oneshot::Receiver<MuxStream>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        debug!(correlation_id = id, "Registered pending work connection");
        (id, rx)
    }

    /// Hand `stream` to the waiter for `id`
    ///
    /// Gives the stream back when nobody is waiting anymore, so the caller can
    /// pool or drop it.
    pub fn complete(&self, id: u64, stream: MuxStream) -> Result<(), MuxStream> {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(stream).map_err(|stream| {
                debug!(correlation_id = id, "Work connection waiter already gone");
                stream
            }),
            None => {
                warn!(correlation_id = id, "No pending work request for correlation id");
                Err(stream)
            }
        }
    }

    /// Abandon a request, e.g. after its timeout
    pub fn cancel(&self, id: u64) {
        if self.waiters.remove(&id).is_some() {
            debug!(correlation_id = id, "Cancelled pending work connection");
        }
    }

    /// Fail every waiter; their receivers observe a closed channel
    pub fn fail_all(&self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn count(&self) -> usize {
        self.waiters.len()
    }
}
