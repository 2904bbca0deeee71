use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::ServerStats;

/// Forwarder counters. Plain atomics; snapshots are not mutually
/// consistent and do not need to be.
#[derive(Debug, Default)]
pub struct Counters {
    requests_handled: AtomicU64,
    bytes_transferred: AtomicU64,
    active_connections: AtomicI64,
    failed_requests: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Track one in-flight forwarding attempt; decremented on drop
    pub fn track(self: &Arc<Self>) -> ActiveGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            counters: self.clone(),
        }
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard for the active-connection gauge
pub struct ActiveGuard {
    counters: Arc<Counters>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = Counters::new();

        counters.request_handled();
        counters.request_handled();
        counters.request_failed();
        counters.add_bytes(100);
        counters.add_bytes(24);

        let stats = counters.snapshot();
        assert_eq!(stats.requests_handled, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.bytes_transferred, 124);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_active_guard_balances() {
        let counters = Counters::new();

        {
            let _a = counters.track();
            let _b = counters.track();
            assert_eq!(counters.snapshot().active_connections, 2);
        }

        assert_eq!(counters.snapshot().active_connections, 0);
    }
}
