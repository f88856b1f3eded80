//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for one relay instance.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total client connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently relaying (upstream connect started, not closed).
    pub connections_active: AtomicU64,
    /// Total connections closed, including failed connects.
    pub connections_closed: AtomicU64,
    /// Upstream connects that failed.
    pub connect_failures: AtomicU64,
    /// Upstream connects that did not complete in time.
    pub connect_timeouts: AtomicU64,
    /// Bytes written to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes written back to clients.
    pub bytes_from_upstream: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    pub connect_timeouts: u64,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connect_timeouts: self.connect_timeouts.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
        }
    }
}
