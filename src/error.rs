use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Veil application
#[derive(Error, Debug)]
pub enum VeilError {
    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    // Pool errors
    #[error("No healthy proxies available")]
    NoProxyAvailable,

    #[error("Upstream proxy failed: {0}")]
    UpstreamFailure(String),

    #[error("All upstream proxies exhausted after {attempts} attempts")]
    UpstreamsExhausted { attempts: u32 },

    // Scrape errors
    #[error("Scrape source {source_name} failed: {reason}")]
    ScrapeSourceFailed {
        source_name: &'static str,
        reason: String,
    },

    // Tunnel errors
    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Authentication
    #[error("Proxy authentication required")]
    AuthRequired,

    // Configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid proxy request: {0}")]
    InvalidProxyRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Veil operations
pub type Result<T> = std::result::Result<T, VeilError>;

impl VeilError {
    /// Get the HTTP status code this error maps to on the client-facing side
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            VeilError::InvalidProxyRequest(_) | VeilError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }

            // 407 Proxy Authentication Required
            VeilError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            VeilError::UpstreamFailure(_)
            | VeilError::UpstreamsExhausted { .. }
            | VeilError::ConnectFailed(_)
            | VeilError::TunnelError(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            VeilError::NoProxyAvailable | VeilError::DatabaseUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            VeilError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            VeilError::Database(_)
            | VeilError::ScrapeSourceFailed { .. }
            | VeilError::Io(_)
            | VeilError::Http(_)
            | VeilError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for VeilError {
    fn from(err: hyper::Error) -> Self {
        VeilError::Http(err.to_string())
    }
}

// Convert from reqwest errors outside the probe path (probe failures are data)
impl From<reqwest::Error> for VeilError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VeilError::Timeout
        } else {
            VeilError::UpstreamFailure(err.to_string())
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for VeilError {
    fn from(err: url::ParseError) -> Self {
        VeilError::InvalidProxyRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            VeilError::InvalidProxyRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            VeilError::AuthRequired.status_code(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        assert_eq!(
            VeilError::UpstreamFailure("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            VeilError::UpstreamsExhausted { attempts: 4 }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            VeilError::NoProxyAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(VeilError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(VeilError::InvalidProxyRequest("bad".to_string()).is_client_error());
        assert!(!VeilError::InvalidProxyRequest("bad".to_string()).is_server_error());

        assert!(VeilError::NoProxyAvailable.is_server_error());
        assert!(!VeilError::NoProxyAvailable.is_client_error());
    }
}
