//! Public port allocation for tcp proxies

use crate::config::PortRange;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Range used for `remote_port = 0` when no allowed ranges are configured
pub const DEFAULT_AUTO_RANGE: PortRange = PortRange {
    start: 10000,
    end: 60000,
};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("Port {0} is not in the allowed ranges")]
    NotAllowed(u16),

    #[error("Port {0} is already in use")]
    InUse(u16),

    #[error("No free port left in the allowed ranges")]
    Exhausted,
}

/// Hands out public ports to tcp proxies
///
/// Allocation only reserves the number; binding the socket is the listener's
/// job and may still fail if another process holds the port.
pub trait PortAllocator: Send + Sync {
    /// Reserve `requested`, or any free port when `None`
    fn allocate(&self, proxy: &str, requested: Option<u16>) -> Result<u16, PortError>;

    fn deallocate(&self, proxy: &str);

    fn allocated_port(&self, proxy: &str) -> Option<u16>;
}

#[derive(Default)]
struct Allocations {
    by_proxy: HashMap<String, u16>,
    by_port: HashMap<u16, String>,
    cursor: usize,
}

/// Allocator restricted to a set of port ranges
pub struct RangePortAllocator {
    /// Ports a proxy may request; empty allows any non-zero port
    allowed: Vec<PortRange>,
    /// Ports handed out for `remote_port = 0`
    auto: Vec<PortRange>,
    inner: Mutex<Allocations>,
}

impl RangePortAllocator {
    pub fn new(allowed: Vec<PortRange>) -> Self {
        let auto = if allowed.is_empty() {
            vec![DEFAULT_AUTO_RANGE]
        } else {
            allowed.clone()
        };
        Self {
            allowed,
            auto,
            inner: Mutex::new(Allocations::default()),
        }
    }

    fn is_allowed(&self, port: u16) -> bool {
        port != 0 && (self.allowed.is_empty() || self.allowed.iter().any(|r| r.contains(port)))
    }

    fn auto_port_at(&self, mut index: usize) -> Option<u16> {
        for range in &self.auto {
            if index < range.len() {
                return Some(range.start + index as u16);
            }
            index -= range.len();
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Allocations> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for RangePortAllocator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate(&self, proxy: &str, requested: Option<u16>) -> Result<u16, PortError> {
        let mut inner = self.lock();

        if let Some(&port) = inner.by_proxy.get(proxy) {
            if requested.map_or(true, |r| r == port) {
                return Ok(port);
            }
        }

        let port = match requested {
            Some(port) => {
                if !self.is_allowed(port) {
                    return Err(PortError::NotAllowed(port));
                }
                if inner.by_port.contains_key(&port) {
                    return Err(PortError::InUse(port));
                }
                port
            }
            None => {
                // Round-robin from the last allocation so freed ports are not
                // handed out again straight away
                let total: usize = self.auto.iter().map(PortRange::len).sum();
                let start = inner.cursor;
                let found = (0..total)
                    .map(|offset| (start + offset) % total)
                    .find_map(|index| {
                        self.auto_port_at(index)
                            .filter(|port| !inner.by_port.contains_key(port))
                            .map(|port| (index, port))
                    });

                let (index, port) = found.ok_or(PortError::Exhausted)?;
                inner.cursor = (index + 1) % total;
                port
            }
        };

        if let Some(old) = inner.by_proxy.insert(proxy.to_string(), port) {
            inner.by_port.remove(&old);
        }
        inner.by_port.insert(port, proxy.to_string());
        Ok(port)
    }

    fn deallocate(&self, proxy: &str) {
        let mut inner = self.lock();
        if let Some(port) = inner.by_proxy.remove(proxy) {
            inner.by_port.remove(&port);
        }
    }

    fn allocated_port(&self, proxy: &str) -> Option<u16> {
        self.lock().by_proxy.get(proxy).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_port() {
        let allocator = RangePortAllocator::default();
        assert_eq!(allocator.allocate("ssh", Some(6000)), Ok(6000));
        assert_eq!(allocator.allocated_port("ssh"), Some(6000));

        assert_eq!(
            allocator.allocate("other", Some(6000)),
            Err(PortError::InUse(6000))
        );
    }

    #[test]
    fn test_allowed_ranges() {
        let allocator = RangePortAllocator::new(vec![PortRange::new(6000, 6001)]);
        assert_eq!(
            allocator.allocate("ssh", Some(22)),
            Err(PortError::NotAllowed(22))
        );

        assert_eq!(allocator.allocate("a", None), Ok(6000));
        assert_eq!(allocator.allocate("b", None), Ok(6001));
        assert_eq!(allocator.allocate("c", None), Err(PortError::Exhausted));
    }

    #[test]
    fn test_deallocate_frees_port() {
        let allocator = RangePortAllocator::new(vec![PortRange::single(7000)]);
        assert_eq!(allocator.allocate("a", None), Ok(7000));

        allocator.deallocate("a");
        assert_eq!(allocator.allocated_port("a"), None);
        assert_eq!(allocator.allocate("b", Some(7000)), Ok(7000));
    }

    #[test]
    fn test_same_proxy_keeps_port() {
        let allocator = RangePortAllocator::default();
        let port = allocator.allocate("a", None).unwrap();
        assert!(DEFAULT_AUTO_RANGE.contains(port));
        assert_eq!(allocator.allocate("a", None), Ok(port));
    }

    #[test]
    fn test_auto_allocation_skips_taken_ports() {
        let allocator = RangePortAllocator::new(vec![PortRange::new(8000, 8002)]);
        assert_eq!(allocator.allocate("fixed", Some(8000)), Ok(8000));
        assert_eq!(allocator.allocate("auto", None), Ok(8001));
    }
}
