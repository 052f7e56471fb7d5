//! Listener tasks owned by tcp proxies
//!
//! Aborting a proxy's task drops its listening socket, so unbinding a proxy
//! closes the public port.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// proxy name -> listener task
#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `handle` for `proxy`, aborting any task it replaces
    pub fn register(&self, proxy: String, handle: JoinHandle<()>) {
        if let Some(old) = self.tasks().insert(proxy, handle) {
            old.abort();
        }
    }

    /// Abort and forget the task for `proxy`
    pub fn unregister(&self, proxy: &str) -> bool {
        match self.tasks().remove(proxy) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn abort_all(&self) {
        for (_, handle) in self.tasks().drain() {
            handle.abort();
        }
    }
}
