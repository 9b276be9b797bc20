//! Per-request context: the correlation id plus the request metadata every
//! log line and response needs.
//!
//! [`attach_request_context`] mints a [`RequestContext`] once per inbound
//! request, runs the rest of the stack inside a `request` span and stamps the
//! id on the outgoing response as `X-Request-ID`. Handlers and middleware
//! receive the context as a typed extractor and pass it by reference to the
//! authenticator, the upstream client and the response encoder.
//!
//! The id is never taken from the inbound request: a caller-supplied
//! `X-Request-ID` is logged as `caller_request_id` but not adopted.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::lifecycle::ClientAddr;

/// Header carrying the correlation id on responses and upstream calls.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Placeholder used when the peer address is not known.
const UNKNOWN_CLIENT: &str = "unknown";

/// Newtype wrapper for request correlation IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Create a request ID from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new UUID v7 request ID.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the request ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a handler needs to know about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    client_addr: String,
    method: Method,
    path: String,
    started_at: Instant,
}

impl RequestContext {
    /// Build a context with a freshly generated id.
    pub fn new(client_addr: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::generate(),
            client_addr: client_addr.into(),
            method,
            path: path.into(),
            started_at: Instant::now(),
        }
    }

    fn capture(extensions: &Extensions, method: &Method, path: &str) -> Self {
        let client_addr = extensions
            .get::<ConnectInfo<ClientAddr>>()
            .map(|ConnectInfo(client)| client.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

        Self::new(client_addr, method.clone(), path)
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Peer address as `ip:port`, or `unknown`.
    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since the context was created, in fractional milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Insert the correlation id header, replacing any existing value.
    pub fn stamp(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(self.request_id.as_str()) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    /// Reuses the context attached by [`attach_request_context`]. Routers
    /// built without that middleware get a fresh context, cached in the
    /// extensions so every extraction within the request agrees.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ctx) = parts.extensions.get::<RequestContext>() {
            return Ok(ctx.clone());
        }

        let ctx = RequestContext::capture(&parts.extensions, &parts.method, parts.uri.path());
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

/// Middleware that attaches a [`RequestContext`] to every request and the
/// matching `X-Request-ID` header to every response.
pub async fn attach_request_context(mut request: Request, next: Next) -> Response {
    let ctx = RequestContext::capture(request.extensions(), request.method(), request.uri().path());

    if let Some(caller_id) = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        tracing::debug!(
            request_id = %ctx.request_id(),
            caller_request_id = caller_id,
            "caller supplied its own request id"
        );
    }

    request.extensions_mut().insert(ctx.clone());

    let span = info_span!(
        "request",
        request_id = %ctx.request_id(),
        method = %ctx.method(),
        path = %ctx.path(),
        client_ip = %ctx.client_addr(),
    );

    let mut response = next.run(request).instrument(span).await;
    ctx.stamp(response.headers_mut());
    response
}
