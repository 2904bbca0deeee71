//! Embedded SQLite store: pool bootstrap and schema migrations

mod migrations;
mod pool;

pub use pool::Database;
