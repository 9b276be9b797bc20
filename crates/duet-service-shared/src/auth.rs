//! Shared-secret authentication for the greeting service.
//!
//! A request carries its credential in the `X-Auth-Key` header. The
//! [`Authenticator`] hands the presented value to a [`CredentialVerifier`];
//! the only verifier today is [`StaticKeyVerifier`], which compares against a
//! single configured key in constant time.
//!
//! Every attempt is logged with the correlation id and request metadata.
//! A rejected credential is only ever logged through [`mask_secret`].

use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::error::ServiceError;
use crate::metrics::record_auth_attempt;

/// Header carrying the shared secret.
pub const AUTH_HEADER: HeaderName = HeaderName::from_static("x-auth-key");

const MASK: &str = "****";

/// Mask a secret for logging.
///
/// Keeps the first two and last two characters of values longer than four
/// characters; anything shorter collapses to a fixed mask.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return MASK.to_string();
    }

    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{MASK}{tail}")
}

/// Compare two byte strings without an early exit on the first mismatch.
///
/// Inputs of different length are rejected immediately; only the length is
/// observable through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}

/// Decides whether a presented credential is acceptable.
pub trait CredentialVerifier: Send + Sync {
    /// `presented` is `None` when the header was absent or not valid UTF-8.
    fn verify(&self, presented: Option<&str>) -> bool;
}

/// Verifier for a single static shared secret.
pub struct StaticKeyVerifier {
    key: String,
}

impl StaticKeyVerifier {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl CredentialVerifier for StaticKeyVerifier {
    fn verify(&self, presented: Option<&str>) -> bool {
        // An absent header never matches, even against an empty key.
        let presented = match presented {
            Some(value) => value,
            None => return false,
        };
        constant_time_eq(presented.as_bytes(), self.key.as_bytes())
    }
}

impl fmt::Debug for StaticKeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyVerifier")
            .field("key", &mask_secret(&self.key))
            .finish()
    }
}

/// Result of checking a request's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Verified,
    Rejected,
}

/// Gate placed in front of authenticated routes.
///
/// Cheap to clone; the verifier is shared behind an `Arc`.
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn CredentialVerifier>,
    header: HeaderName,
}

impl Authenticator {
    /// Wrap an arbitrary verifier, reading the credential from `X-Auth-Key`.
    pub fn new(verifier: impl CredentialVerifier + 'static) -> Self {
        Self {
            verifier: Arc::new(verifier),
            header: AUTH_HEADER,
        }
    }

    /// Authenticator for a single static key.
    pub fn static_key(key: impl Into<String>) -> Self {
        Self::new(StaticKeyVerifier::new(key))
    }

    /// Read the credential from a different header.
    pub fn with_header(mut self, header: HeaderName) -> Self {
        self.header = header;
        self
    }

    /// Check the credential on `headers`, logging the attempt and its result.
    pub fn authenticate(&self, ctx: &RequestContext, headers: &HeaderMap) -> AuthOutcome {
        let presented = headers.get(&self.header).and_then(|v| v.to_str().ok());

        info!(
            request_id = %ctx.request_id(),
            client_ip = ctx.client_addr(),
            method = %ctx.method(),
            path = ctx.path(),
            "Authentication attempt"
        );

        if !self.verifier.verify(presented) {
            warn!(
                request_id = %ctx.request_id(),
                client_ip = ctx.client_addr(),
                method = %ctx.method(),
                path = ctx.path(),
                auth_key_provided = %mask_secret(presented.unwrap_or_default()),
                "Authentication failed"
            );
            record_auth_attempt(AuthOutcome::Rejected);
            return AuthOutcome::Rejected;
        }

        info!(
            request_id = %ctx.request_id(),
            client_ip = ctx.client_addr(),
            method = %ctx.method(),
            path = ctx.path(),
            "Authentication successful"
        );
        record_auth_attempt(AuthOutcome::Verified);
        AuthOutcome::Verified
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Middleware enforcing [`Authenticator`] on the routes it wraps.
///
/// Rejected requests get `401 Unauthorized` and never reach the inner
/// handler.
pub async fn require_credential(
    State(auth): State<Authenticator>,
    ctx: RequestContext,
    request: Request,
    next: Next,
) -> Response {
    match auth.authenticate(&ctx, request.headers()) {
        AuthOutcome::Verified => next.run(request).await,
        AuthOutcome::Rejected => ServiceError::Unauthorized.to_response(&ctx),
    }
}
