//! Port allocation for gateway and bridge processes.
//!
//! A port is either assigned by scanning a configured range or reserved
//! explicitly. Keys are free-form; `port_key` builds the composite
//! `"<sandbox>:<purpose>"` keys the supervisors use.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_PORT_START: u16 = 18790;
pub const DEFAULT_PORT_END: u16 = 18890;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("No available port in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Invalid port: {0}")]
    InvalidPort(u16),
}

#[derive(Default)]
struct PortTable {
    by_key: HashMap<String, u16>,
    in_use: HashSet<u16>,
}

impl PortTable {
    fn free_key(&mut self, key: &str) -> Option<u16> {
        let port = self.by_key.remove(key)?;
        self.in_use.remove(&port);
        Some(port)
    }
}

/// Hands out ports from `[start, end]`, one per key.
///
/// The whole read-modify-write sequence of each operation runs under one
/// mutex, so concurrent callers never receive the same port.
pub struct PortAllocator {
    start: u16,
    end: u16,
    table: Mutex<PortTable>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            table: Mutex::new(PortTable::default()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Port for `key`, assigning the first free one in range if none is held yet.
    ///
    /// A port counts as free when no other key holds it and it can be bound
    /// on the loopback interface right now.
    pub fn assign_port(&self, key: &str) -> Result<u16, PortError> {
        let mut table = self.lock();
        if let Some(port) = table.by_key.get(key) {
            return Ok(*port);
        }

        for port in self.start..=self.end {
            if port == 0 || table.in_use.contains(&port) {
                continue;
            }
            if !is_port_available(port) {
                continue;
            }
            table.by_key.insert(key.to_string(), port);
            table.in_use.insert(port);
            info!(key = %key, port, "Port assigned");
            return Ok(port);
        }

        Err(PortError::NoPortAvailable {
            start: self.start,
            end: self.end,
        })
    }

    /// Claim a specific port for `key`.
    ///
    /// Returns `Ok(false)` when another key holds the port. On success any
    /// port previously held by `key` is freed. No bind probe is made: the
    /// caller asked for this port explicitly. The port need not lie in the
    /// assignment range; it is tracked in the same table either way.
    pub fn reserve_port(&self, key: &str, port: u16) -> Result<bool, PortError> {
        if port == 0 {
            return Err(PortError::InvalidPort(port));
        }

        let mut table = self.lock();
        match table.by_key.get(key) {
            Some(current) if *current == port => return Ok(true),
            _ => {}
        }
        if table.in_use.contains(&port) {
            debug!(key = %key, port, "Port held by another key");
            return Ok(false);
        }

        table.free_key(key);
        table.by_key.insert(key.to_string(), port);
        table.in_use.insert(port);
        info!(key = %key, port, "Port reserved");
        Ok(true)
    }

    /// Free the port held by `key`. Returns whether a port was freed.
    pub fn release_port(&self, key: &str) -> bool {
        match self.lock().free_key(key) {
            Some(port) => {
                info!(key = %key, port, "Port released");
                true
            }
            None => false,
        }
    }

    pub fn port_for(&self, key: &str) -> Option<u16> {
        self.lock().by_key.get(key).copied()
    }

    /// Snapshot of all assignments.
    pub fn in_use(&self) -> HashMap<String, u16> {
        self.lock().by_key.clone()
    }

    pub fn reset(&self) {
        let mut table = self.lock();
        table.by_key.clear();
        table.in_use.clear();
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_START, DEFAULT_PORT_END)
    }
}

/// Composite allocation key for one purpose within one sandbox.
pub fn port_key(sandbox: &str, purpose: &str) -> String {
    format!("{}:{}", sandbox, purpose)
}

/// Whether the port can be bound on the loopback interface.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A small range starting at a port the OS just handed out, so it is very
    /// likely free for the duration of the test.
    fn free_range(width: u16) -> (u16, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let start = port.min(u16::MAX - width);
        (start, start + width)
    }

    #[test]
    fn test_assign_is_idempotent_per_key() {
        let (start, end) = free_range(10);
        let ports = PortAllocator::new(start, end);
        let a = ports.assign_port("ubuntu:gateway").unwrap();
        assert_eq!(ports.assign_port("ubuntu:gateway").unwrap(), a);
        let b = ports.assign_port("debian:gateway").unwrap();
        assert_ne!(a, b);
        assert_eq!(ports.in_use().len(), 2);
    }

    #[test]
    fn test_assign_skips_bound_ports() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        if busy == u16::MAX {
            return;
        }
        let ports = PortAllocator::new(busy, busy + 1);
        match ports.assign_port("k") {
            Ok(port) => assert_ne!(port, busy),
            Err(e) => assert_eq!(
                e,
                PortError::NoPortAvailable {
                    start: busy,
                    end: busy + 1
                }
            ),
        }
    }

    #[test]
    fn test_exhaustion() {
        let (start, _) = free_range(0);
        let ports = PortAllocator::new(start, start);
        ports.reserve_port("holder", start).unwrap();
        assert_eq!(
            ports.assign_port("other"),
            Err(PortError::NoPortAvailable { start, end: start })
        );
    }

    #[test]
    fn test_reserve_conflict_and_move() {
        let ports = PortAllocator::new(20000, 20010);
        assert_eq!(ports.reserve_port("a", 20001), Ok(true));
        assert_eq!(ports.reserve_port("b", 20001), Ok(false));
        assert_eq!(ports.port_for("a"), Some(20001));
        assert_eq!(ports.port_for("b"), None);

        // Moving a key frees its previous port.
        assert_eq!(ports.reserve_port("a", 20002), Ok(true));
        assert_eq!(ports.reserve_port("b", 20001), Ok(true));
        assert_eq!(ports.port_for("a"), Some(20002));
    }

    #[test]
    fn test_reserve_rejects_port_zero() {
        let ports = PortAllocator::new(20000, 20010);
        assert_eq!(ports.reserve_port("a", 0), Err(PortError::InvalidPort(0)));
        assert_eq!(ports.port_for("a"), None);
    }

    #[test]
    fn test_reserve_outside_range() {
        let ports = PortAllocator::new(20000, 20010);
        assert_eq!(ports.reserve_port("a", 8080), Ok(true));
        assert_eq!(ports.reserve_port("b", 8080), Ok(false));
        assert_eq!(ports.port_for("a"), Some(8080));

        // Moving back into the range frees the out-of-range port.
        assert_eq!(ports.reserve_port("a", 20003), Ok(true));
        assert_eq!(ports.reserve_port("b", 8080), Ok(true));
        assert!(ports.release_port("b"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = PortAllocator::new(20000, 20010);
        ports.reserve_port("a", 20005).unwrap();
        assert!(ports.release_port("a"));
        assert!(!ports.release_port("a"));
        assert_eq!(ports.reserve_port("b", 20005), Ok(true));
    }

    #[test]
    fn test_reset() {
        let ports = PortAllocator::new(20000, 20010);
        ports.reserve_port("a", 20005).unwrap();
        ports.reset();
        assert!(ports.in_use().is_empty());
    }

    #[test]
    fn test_port_key() {
        assert_eq!(port_key("ubuntu", "bridge"), "ubuntu:bridge");
    }
}
