use std::collections::HashMap;

use serde::Serialize;

/// Snapshot of the rotation cache, as exposed by `/stats`
#[derive(Debug, Clone, Serialize, Default)]
pub struct PoolStats {
    pub cached_proxies: usize,
    pub cached_healthy: usize,
    pub proxy_kinds: HashMap<String, usize>,
    pub proxy_countries: HashMap<String, usize>,
}

/// Persistent-store statistics
#[derive(Debug, Clone, Serialize, Default)]
pub struct StoreStats {
    pub total: i64,
    pub healthy: i64,
    pub by_kind: HashMap<String, i64>,
}

/// Forwarder counter snapshot
#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct ServerStats {
    pub requests_handled: u64,
    pub bytes_transferred: u64,
    pub active_connections: i64,
    pub failed_requests: u64,
}
