//! Client-facing forwarder: listener, request handler, CONNECT tunneling,
//! authentication, and traffic counters

mod auth;
mod handler;
mod server;
mod stats;
mod tunnel;

pub use auth::BearerAuth;
pub use handler::ForwardHandler;
pub use server::ProxyServer;
pub use stats::Counters;
