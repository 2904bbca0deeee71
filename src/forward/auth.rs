use hyper::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::Request;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::{Result, VeilError};

/// Bearer-token gate for everything except `/health`
#[derive(Clone)]
pub struct BearerAuth {
    token: Option<String>,
}

impl BearerAuth {
    /// An empty token disables authentication
    pub fn new(token: &str) -> Self {
        Self {
            token: if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Validate the `Proxy-Authorization: Bearer <token>` header
    pub fn validate<T>(&self, req: &Request<T>) -> Result<()> {
        let Some(expected) = &self.token else {
            return Ok(());
        };

        let header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .ok_or(VeilError::AuthRequired)?;

        let value = header.to_str().map_err(|_| VeilError::AuthRequired)?;

        let Some(presented) = value.strip_prefix("Bearer ") else {
            warn!("Proxy auth header is not a Bearer token");
            return Err(VeilError::AuthRequired);
        };

        // Constant-time comparison; only the token length leaks
        if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
            Ok(())
        } else {
            warn!("Proxy auth token mismatch");
            Err(VeilError::AuthRequired)
        }
    }

    /// 407 challenge sent on missing or mismatched credentials
    pub fn challenge_response<T>(&self) -> hyper::Response<T>
    where
        T: Default,
    {
        hyper::Response::builder()
            .status(hyper::StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(PROXY_AUTHENTICATE, "Bearer")
            .body(T::default())
            .unwrap()
    }
}
