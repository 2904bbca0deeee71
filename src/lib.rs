//! Veil - Anonymizing Rotating Forward Proxy
//!
//! Veil aggregates free public proxies from remote list providers,
//! validates them against a reachability probe, persists their health
//! state in an embedded SQLite store, and dispatches client traffic
//! through a rotating pool of currently-healthy upstreams.
//!
//! ## Features
//!
//! - Plain HTTP forwarding and CONNECT tunneling (SOCKS-aware upstream dialing)
//! - Cache-aware, batched, concurrent health checking
//! - Round-robin rotation with cache-only failure eviction
//! - Identifying-header stripping and User-Agent rewriting
//! - Optional bearer-token authentication on the management endpoints

pub mod checker;
pub mod config;
pub mod database;
pub mod error;
pub mod forward;
pub mod models;
pub mod pool;
pub mod repository;
pub mod scrape;

pub use config::Config;
pub use database::Database;
pub use error::{Result, VeilError};
pub use forward::ProxyServer;
pub use pool::PoolManager;
