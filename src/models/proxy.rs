use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Upstream proxy protocol kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyKind::Http),
            "https" => Some(ProxyKind::Https),
            "socks4" => Some(ProxyKind::Socks4),
            "socks5" => Some(ProxyKind::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyKind::Socks4 | ProxyKind::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ProxyKind::Http | ProxyKind::Https)
    }

    /// URL scheme used when dialing through this upstream.
    ///
    /// SOCKS4 records are dialed with the SOCKS5 handshake; most of them
    /// will fail the probe and drop out of the pool.
    pub fn dial_scheme(&self) -> &'static str {
        match self {
            ProxyKind::Http | ProxyKind::Https => "http",
            ProxyKind::Socks4 | ProxyKind::Socks5 => "socks5",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health classification of an upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Timeout,
    Error,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Unknown => "unknown",
            ProxyStatus::Healthy => "healthy",
            ProxyStatus::Unhealthy => "unhealthy",
            ProxyStatus::Timeout => "timeout",
            ProxyStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "healthy" => ProxyStatus::Healthy,
            "unhealthy" => ProxyStatus::Unhealthy,
            "timeout" => ProxyStatus::Timeout,
            "error" => ProxyStatus::Error,
            _ => ProxyStatus::Unknown,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProxyStatus::Healthy)
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatchable upstream proxy.
///
/// This is the volatile shape that flows through the scrapers, the
/// checker, and the rotation cache. The persistent row is [`ProxyRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            country: None,
        }
    }

    /// `host:port`, the dedup key across the whole pipeline
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL used to configure an HTTP client to dial through this upstream
    pub fn dial_url(&self) -> String {
        format!("{}://{}:{}", self.kind.dial_scheme(), self.host, self.port)
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.host, self.port)
    }
}

/// Persistent proxy row
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProxyRecord {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub kind: String,
    pub country: Option<String>,
    pub anonymity: Option<String>,
    pub status: String,
    pub response_time_ms: Option<i64>,
    pub fail_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn kind_enum(&self) -> ProxyKind {
        ProxyKind::parse(&self.kind).unwrap_or(ProxyKind::Http)
    }

    pub fn status_enum(&self) -> ProxyStatus {
        ProxyStatus::parse(&self.status)
    }

    /// Project the row down to a dispatchable pool entry
    pub fn to_proxy(&self) -> Proxy {
        Proxy {
            host: self.host.clone(),
            port: self.port,
            kind: self.kind_enum(),
            country: self.country.clone(),
        }
    }

    /// Rebuild the probe outcome this row last recorded
    pub fn cached_result(&self) -> CheckResult {
        CheckResult {
            proxy: self.to_proxy(),
            status: self.status_enum(),
            response_time: Duration::from_millis(
                self.response_time_ms.unwrap_or(0).max(0) as u64
            ),
            error: None,
            checked_at: self.last_checked_at.unwrap_or(self.first_seen_at),
        }
    }
}

/// Outcome of a single health probe
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub proxy: Proxy,
    pub status: ProxyStatus,
    pub response_time: Duration,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// Keep only the healthy proxies out of a probe result set
pub fn filter_healthy(results: &[CheckResult]) -> Vec<Proxy> {
    results
        .iter()
        .filter(|r| r.is_healthy())
        .map(|r| r.proxy.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_and_helpers() {
        assert_eq!(ProxyKind::parse("HTTP"), Some(ProxyKind::Http));
        assert_eq!(ProxyKind::parse("https"), Some(ProxyKind::Https));
        assert_eq!(ProxyKind::parse("SOCKS4"), Some(ProxyKind::Socks4));
        assert_eq!(ProxyKind::parse("socks5"), Some(ProxyKind::Socks5));
        assert_eq!(ProxyKind::parse("gopher"), None);

        assert!(ProxyKind::Socks5.is_socks());
        assert!(!ProxyKind::Https.is_socks());
        assert!(ProxyKind::Http.is_http());
        assert!(!ProxyKind::Socks4.is_http());

        assert_eq!(ProxyKind::Socks4.to_string(), "socks4");
    }

    #[test]
    fn test_socks4_dials_with_socks5_scheme() {
        assert_eq!(ProxyKind::Socks4.dial_scheme(), "socks5");
        assert_eq!(ProxyKind::Socks5.dial_scheme(), "socks5");
        assert_eq!(ProxyKind::Http.dial_scheme(), "http");
        assert_eq!(ProxyKind::Https.dial_scheme(), "http");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(ProxyStatus::parse("healthy"), ProxyStatus::Healthy);
        assert_eq!(ProxyStatus::parse("UNHEALTHY"), ProxyStatus::Unhealthy);
        assert_eq!(ProxyStatus::parse("timeout"), ProxyStatus::Timeout);
        assert_eq!(ProxyStatus::parse("error"), ProxyStatus::Error);
        assert_eq!(ProxyStatus::parse("whatever"), ProxyStatus::Unknown);

        assert!(ProxyStatus::Healthy.is_healthy());
        assert!(!ProxyStatus::Timeout.is_healthy());
    }

    #[test]
    fn test_proxy_address_and_dial_url() {
        let proxy = Proxy::new("1.2.3.4", 8080, ProxyKind::Http);
        assert_eq!(proxy.address(), "1.2.3.4:8080");
        assert_eq!(proxy.dial_url(), "http://1.2.3.4:8080");

        let socks = Proxy::new("5.6.7.8", 1080, ProxyKind::Socks4);
        assert_eq!(socks.dial_url(), "socks5://5.6.7.8:1080");
    }

    #[test]
    fn test_filter_healthy() {
        let mk = |status| CheckResult {
            proxy: Proxy::new("1.2.3.4", 80, ProxyKind::Http),
            status,
            response_time: Duration::from_millis(10),
            error: None,
            checked_at: Utc::now(),
        };

        let results = vec![
            mk(ProxyStatus::Healthy),
            mk(ProxyStatus::Unhealthy),
            mk(ProxyStatus::Timeout),
            mk(ProxyStatus::Healthy),
        ];

        assert_eq!(filter_healthy(&results).len(), 2);
    }
}
