//! Store operations over the SQLite pool

mod proxy;

pub use proxy::{chunk_updates, ProxyRepository, MAX_UPDATE_BATCH};
