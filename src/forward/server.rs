//! Client-facing proxy listener
//!
//! Plain HTTP/1.1 with upgrades for CONNECT; every accepted connection is
//! served by the shared [`ForwardHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use super::handler::ForwardHandler;
use super::stats::Counters;
use crate::config::ServerConfig;
use crate::error::{Result, VeilError};
use crate::pool::PoolManager;

const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// The proxy server
pub struct ProxyServer {
    config: ServerConfig,
    handler: Arc<ForwardHandler>,
    connection_limit: Arc<Semaphore>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, manager: Arc<PoolManager>) -> Self {
        let handler = Arc::new(ForwardHandler::new(manager, config.clone()));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Self {
            config,
            handler,
            connection_limit,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.handler.counters()
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .map_err(|_| VeilError::InvalidConfig(format!("bad listen address: {}", self.config.listen_addr)))?;

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Proxy server listening");

        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener; returns after the
    /// shutdown signal flips
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            let Ok(permit) = self.connection_limit.clone().try_acquire_owned() else {
                                warn!(%client_addr, "Connection limit reached, dropping connection");
                                continue;
                            };

                            let handler = self.handler.clone();
                            let read_timeout = self.config.read_timeout();

                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) =
                                    serve_connection(stream, handler, read_timeout).await
                                {
                                    debug!(%client_addr, error = %e, "Connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    handler: Arc<ForwardHandler>,
    read_timeout: std::time::Duration,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    // header_read_timeout is the only deadline http1 connections expose;
    // it also bounds idle keep-alive waits between requests.
    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .max_buf_size(MAX_HEADER_BYTES)
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| VeilError::Http(e.to_string()))?;

    Ok(())
}
