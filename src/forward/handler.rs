//! Proxy request handling: endpoint routing, plain HTTP forwarding with
//! retry across upstreams, and CONNECT orchestration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::auth::BearerAuth;
use super::stats::Counters;
use super::tunnel;
use crate::config::ServerConfig;
use crate::error::{Result, VeilError};
use crate::models::Proxy;
use crate::pool::PoolManager;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const FORWARD_MAX_IDLE_PER_HOST: usize = 100;

/// Request handler shared across connections
pub struct ForwardHandler {
    manager: Arc<PoolManager>,
    config: ServerConfig,
    auth: BearerAuth,
    counters: Arc<Counters>,
    /// Lowercased strip_headers for case-insensitive matching
    strip_set: HashSet<String>,
}

impl ForwardHandler {
    pub fn new(manager: Arc<PoolManager>, config: ServerConfig) -> Self {
        let auth = BearerAuth::new(&config.auth_token);
        let strip_set = config
            .strip_headers
            .iter()
            .map(|h| h.to_lowercase())
            .collect();

        Self {
            manager,
            config,
            auth,
            counters: Counters::new(),
            strip_set,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Entry point for every request on the listener
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        // Local endpoints arrive in origin form (no authority)
        let is_local = req.uri().authority().is_none() && req.method() != Method::CONNECT;

        if is_local && req.method() == Method::GET && req.uri().path() == "/health" {
            return self.handle_health();
        }

        if self.auth.validate(&req).is_err() {
            return self.auth.challenge_response();
        }

        if is_local {
            return match (req.method(), req.uri().path()) {
                (&Method::GET, "/stats") => self.handle_stats().await,
                (&Method::GET, "/proxies") => self.handle_proxies(),
                _ => error_response(StatusCode::BAD_REQUEST, "Invalid proxy request"),
            };
        }

        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        // Plain forwarding needs an absolute URL
        if req.uri().scheme().is_none() || req.uri().host().is_none() {
            return error_response(StatusCode::BAD_REQUEST, "Invalid proxy request");
        }

        self.handle_forward(req).await
    }

    /// `GET /health`; public even with auth enabled
    fn handle_health(&self) -> Response<Full<Bytes>> {
        let healthy = self.manager.healthy_count();

        if healthy == 0 {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "No healthy proxies");
        }

        text_response(
            StatusCode::OK,
            format!("OK - {healthy} healthy proxies available"),
        )
    }

    /// `GET /stats`: pool, store, and forwarder statistics
    async fn handle_stats(&self) -> Response<Full<Bytes>> {
        let database_stats = match self.manager.store_stats().await {
            Ok(stats) => json!(stats),
            Err(e) => {
                warn!(error = %e, "Store stats unavailable");
                json!("not_available")
            }
        };

        let body = json!({
            "proxy_stats": self.manager.stats(),
            "database_stats": database_stats,
            "server_stats": self.counters.snapshot(),
        });

        json_response(StatusCode::OK, &body)
    }

    /// `GET /proxies`: the current rotation cache
    fn handle_proxies(&self) -> Response<Full<Bytes>> {
        json_response(StatusCode::OK, &json!(self.manager.snapshot()))
    }

    /// Forward a plain HTTP request, rotating across upstreams on failure
    async fn handle_forward(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let _active = self.counters.track();

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Failed to read request body: {e}"),
                );
            }
        };

        let target = parts.uri.to_string();
        let headers = self.outbound_headers(&parts.headers);

        let max_attempts = self.config.max_retries.max(1);
        let mut last_error: Option<VeilError> = None;

        for attempt in 1..=max_attempts {
            let proxy = match self.manager.next() {
                Ok(proxy) => proxy,
                Err(_) => {
                    self.counters.request_failed();
                    return error_response(StatusCode::SERVICE_UNAVAILABLE, "No proxy available");
                }
            };

            debug!(
                upstream = %proxy.address(),
                attempt,
                max_attempts,
                "Forwarding request through upstream"
            );

            match self
                .forward_once(&proxy, &parts.method, &target, &headers, body.clone())
                .await
            {
                Ok(response) => {
                    self.counters.request_handled();
                    return response;
                }
                Err(e) => {
                    warn!(
                        upstream = %proxy.address(),
                        attempt,
                        error = %e,
                        "Forward attempt failed"
                    );
                    self.manager.report_failure(&proxy);
                    last_error = Some(e);
                }
            }
        }

        self.counters.request_failed();
        error!(attempts = max_attempts, "All upstream proxies failed");
        error_response(
            StatusCode::BAD_GATEWAY,
            &format!(
                "All upstream proxies failed: {}",
                last_error.unwrap_or(VeilError::NoProxyAvailable)
            ),
        )
    }

    /// One forwarding attempt through one upstream
    async fn forward_once(
        &self,
        proxy: &Proxy,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>> {
        let client = self.build_forward_client(proxy)?;

        let response = client
            .request(method.clone(), target)
            .headers(headers.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut builder = Response::builder().status(status);

        for (name, value) in response.headers() {
            if should_drop_response_header(name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let body = response.bytes().await?;
        self.counters.add_bytes(body.len() as u64);

        builder
            .body(Full::new(body))
            .map_err(|e| VeilError::Internal(format!("Failed to build response: {e}")))
    }

    /// Transport tuned to the upstream's kind; disposed after the attempt
    fn build_forward_client(&self, proxy: &Proxy) -> Result<reqwest::Client> {
        let upstream = reqwest::Proxy::all(proxy.dial_url())
            .map_err(|e| VeilError::UpstreamFailure(e.to_string()))?;

        reqwest::Client::builder()
            .proxy(upstream)
            .connect_timeout(FORWARD_CONNECT_TIMEOUT)
            .timeout(FORWARD_TIMEOUT)
            .pool_idle_timeout(FORWARD_IDLE_TIMEOUT)
            .pool_max_idle_per_host(FORWARD_MAX_IDLE_PER_HOST)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| VeilError::UpstreamFailure(e.to_string()))
    }

    /// Headers sent upstream: hop-by-hop and identifying headers removed,
    /// configured headers set last (replacing)
    fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in inbound {
            let lower = name.as_str().to_lowercase();
            if is_hop_by_hop(&lower) || lower == "proxy-connection" || self.strip_set.contains(&lower)
            {
                continue;
            }
            headers.append(name, value.clone());
        }

        for (key, value) in &self.config.add_headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) else {
                warn!(header = %key, "Skipping unparsable add_headers entry");
                continue;
            };
            headers.insert(name, value);
        }

        headers
    }

    /// CONNECT: establish an upstream tunnel, answer 200, splice bytes
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let _active = self.counters.track();

        let authority = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                return error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
            }
        };

        let (host, port) = match parse_authority(&authority) {
            Ok(target) => target,
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, "Invalid CONNECT target");
            }
        };

        if !self.config.enable_https {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "HTTPS tunneling disabled");
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut last_error: Option<VeilError> = None;

        for attempt in 1..=max_attempts {
            let proxy = match self.manager.next() {
                Ok(proxy) => proxy,
                Err(_) => {
                    self.counters.request_failed();
                    return error_response(StatusCode::SERVICE_UNAVAILABLE, "No proxy available");
                }
            };

            debug!(
                upstream = %proxy.address(),
                target = %authority,
                attempt,
                max_attempts,
                "Attempting CONNECT tunnel"
            );

            match self.establish_tunnel(&proxy, &host, port).await {
                Ok(upstream) => {
                    info!(
                        upstream = %proxy.address(),
                        target = %authority,
                        "CONNECT tunnel established"
                    );
                    self.counters.request_handled();
                    return self.spawn_splice(req, upstream);
                }
                Err(e) => {
                    warn!(
                        upstream = %proxy.address(),
                        target = %authority,
                        attempt,
                        error = %e,
                        "CONNECT attempt failed"
                    );
                    self.manager.report_failure(&proxy);
                    last_error = Some(e);
                }
            }
        }

        self.counters.request_failed();
        error!(target = %authority, attempts = max_attempts, "All CONNECT attempts failed");
        error_response(
            StatusCode::BAD_GATEWAY,
            &format!(
                "Failed to establish tunnel: {}",
                last_error.unwrap_or(VeilError::NoProxyAvailable)
            ),
        )
    }

    /// Primary tunnel, with the keep-alive fallback on protocol-level
    /// rejection only (a dead dial just moves to the next upstream)
    async fn establish_tunnel(
        &self,
        proxy: &Proxy,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn tunnel::TunnelConn>> {
        match tunnel::open_tunnel(proxy, host, port).await {
            Ok(upstream) => Ok(upstream),
            Err(VeilError::ConnectFailed(reason)) => {
                debug!(
                    upstream = %proxy.address(),
                    reason = %reason,
                    "Primary CONNECT refused, trying fallback"
                );
                tunnel::open_tunnel_fallback(proxy, host, port).await
            }
            Err(e) => Err(e),
        }
    }

    /// Answer 200 and hand the upgraded connection to the splice task
    fn spawn_splice(
        &self,
        req: Request<Incoming>,
        upstream: Box<dyn tunnel::TunnelConn>,
    ) -> Response<Full<Bytes>> {
        let counters = self.counters.clone();

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    match tunnel::copy_bidirectional(client, upstream).await {
                        Ok((sent, received)) => counters.add_bytes(sent + received),
                        Err(e) => debug!(error = %e, "Tunnel splice ended with error"),
                    }
                }
                Err(e) => debug!(error = %e, "Client upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }
}

/// Headers scoped to one hop, never forwarded in either direction
fn is_hop_by_hop(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Response headers dropped to hide the upstream, plus hop-by-hop ones
/// and the length recomputed from the buffered body
fn should_drop_response_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    is_hop_by_hop(&lower) || matches!(lower.as_str(), "server" | "x-powered-by" | "via" | "content-length")
}

/// `host:port` from a CONNECT authority; bare hosts default to 443
fn parse_authority(authority: &str) -> Result<(String, u16)> {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| VeilError::InvalidProxyRequest(format!("invalid port in {authority}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), 443)),
    }
}

/// Host and port of an absolute request URI
#[allow(dead_code)]
fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| VeilError::InvalidProxyRequest("missing host in URI".to_string()))?
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

fn text_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(message)))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    text_response(status, message.to_string())
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
