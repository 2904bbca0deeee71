//! Domain models shared across the pipeline

mod proxy;
mod stats;

pub use proxy::{filter_healthy, CheckResult, Proxy, ProxyKind, ProxyRecord, ProxyStatus};
pub use stats::{PoolStats, ServerStats, StoreStats};
