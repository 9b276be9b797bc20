//! Outbound calls from the process service to the greeting service.
//!
//! One GET per call, bounded by the client timeout, carrying the caller's
//! correlation id and the shared secret. Failures are classified by the stage
//! that failed so the caller can pick a status code:
//!
//! | stage | variant | caller-facing status |
//! |-------|---------|----------------------|
//! | building the request | [`UpstreamError::Build`] | 500 |
//! | sending / waiting | [`UpstreamError::Dispatch`] | 503 |
//! | non-200 reply | [`UpstreamError::Status`] | the upstream's status |
//! | reading the body | [`UpstreamError::BodyRead`] | 500 |
//! | decoding the body | [`UpstreamError::Decode`] | 500 |
//!
//! Nothing is retried. The upstream response is owned by the call and is
//! dropped (releasing its connection) on every return path.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

use crate::auth::{mask_secret, AUTH_HEADER};
use crate::context::{RequestContext, REQUEST_ID_HEADER};
use crate::metrics::record_upstream_call;

/// Default bound on a single upstream call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of an upstream call, tagged by stage.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request could not be built, e.g. a malformed base address.
    #[error("could not build request for {url}: {source}")]
    Build {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Connection refused, DNS failure, or the call timed out.
    #[error("request to {url} failed: {source}")]
    Dispatch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The upstream answered with something other than 200.
    #[error("service A returned status {}", .status.as_u16())]
    Status { status: StatusCode },

    /// The response body could not be read.
    #[error("could not read response body: {0}")]
    BodyRead(#[source] reqwest::Error),

    /// The response body was not the expected JSON.
    #[error("could not decode response body: {0}")]
    Decode(#[source] serde_json::Error),
}

impl UpstreamError {
    /// Status code surfaced to the downstream caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Dispatch { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Status { status } => *status,
            Self::Build { .. } | Self::BodyRead(_) | Self::Decode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short, caller-safe description of the failed stage.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::Build { .. } => "Failed to create request to Service A",
            Self::Dispatch { .. } => "Failed to call Service A",
            Self::Status { .. } => "Service A request failed",
            Self::BodyRead(_) => "Failed to read Service A response",
            Self::Decode(_) => "Failed to parse Service A response",
        }
    }

    /// Metric label for the failed stage.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Dispatch { .. } => "unavailable",
            Self::Status { .. } => "status",
            Self::BodyRead(_) => "body_read",
            Self::Decode(_) => "decode",
        }
    }
}

/// HTTP client for the greeting service.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    auth_key: String,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a client whose calls are bounded by `timeout`.
    ///
    /// The base address is not validated here; a malformed one surfaces as
    /// [`UpstreamError::Build`] on each call.
    pub fn new(
        base_url: impl Into<String>,
        auth_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_key: auth_key.into(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// GET `path` on the upstream and decode its JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<T, UpstreamError> {
        let result = self.call(ctx, path).await;
        match &result {
            Ok(_) => record_upstream_call("success"),
            Err(err) => record_upstream_call(err.kind()),
        }
        result
    }

    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<T, UpstreamError> {
        let url = self.endpoint(path);

        let request = self
            .client
            .get(&url)
            .header(AUTH_HEADER, self.auth_key.as_str())
            .header(REQUEST_ID_HEADER, ctx.request_id().as_str())
            .build()
            .map_err(|source| UpstreamError::Build {
                url: url.clone(),
                source,
            })?;

        info!(
            request_id = %ctx.request_id(),
            upstream_url = %url,
            auth_key_masked = %mask_secret(&self.auth_key),
            "Calling upstream service"
        );

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|source| UpstreamError::Dispatch {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        info!(
            request_id = %ctx.request_id(),
            status_code = status.as_u16(),
            "Received upstream response"
        );

        if status != StatusCode::OK {
            return Err(UpstreamError::Status { status });
        }

        let body = response.bytes().await.map_err(UpstreamError::BodyRead)?;
        serde_json::from_slice(&body).map_err(UpstreamError::Decode)
    }
}

impl fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url)
            .field("auth_key", &mask_secret(&self.auth_key))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> UpstreamClient {
        UpstreamClient::new(base, "service-a-secret-key", DEFAULT_UPSTREAM_TIMEOUT).unwrap()
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(client("http://service-a:8080").endpoint("/greet"), "http://service-a:8080/greet");
        assert_eq!(client("http://service-a:8080/").endpoint("/greet"), "http://service-a:8080/greet");
        assert_eq!(client("http://gw/api").endpoint("/greet"), "http://gw/api/greet");
    }

    #[test]
    fn test_status_mapping() {
        let status = UpstreamError::Status {
            status: StatusCode::FORBIDDEN,
        };
        assert_eq!(status.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(status.to_string(), "service A returned status 403");

        let decode = UpstreamError::Decode(serde_json::from_str::<u8>("x").unwrap_err());
        assert_eq!(decode.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(decode.summary(), "Failed to parse Service A response");
    }

    #[test]
    fn test_debug_masks_key() {
        let debug = format!("{:?}", client("http://service-a:8080"));
        assert!(!debug.contains("service-a-secret-key"));
        assert!(debug.contains("se****ey"));
    }

    #[tokio::test]
    async fn test_malformed_base_is_build_error() {
        let ctx = RequestContext::new("unknown", axum::http::Method::GET, "/process");
        let err = client("not a url")
            .fetch_json::<serde_json::Value>(&ctx, "/greet")
            .await
            .unwrap_err();

        assert!(matches!(err, UpstreamError::Build { .. }), "got {err:?}");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
