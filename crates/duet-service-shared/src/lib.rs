//! Shared infrastructure for the duet HTTP services.
//!
//! Two services cooperate: the greet service (`/greet`, guarded by a shared
//! secret in `X-Auth-Key`) and the process service (`/process`, which calls
//! `/greet` and merges the answer). This crate holds everything they share:
//!
//! - [`RequestContext`]: Per-request correlation id and request metadata
//! - [`Authenticator`]: Timing-safe shared-secret check as route middleware
//! - [`UpstreamClient`]: Bounded-timeout calls to the greet service
//! - [`encode_json`] and [`ServiceError`]: Buffered JSON and plain-text error responses
//! - [`health()`]: Unauthenticated liveness handler
//! - [`ServiceConfig`]: Environment-sourced configuration
//! - [`lifecycle`]: Listener binding, timeouts and bounded graceful shutdown
//! - [`metrics`]: Prometheus metrics infrastructure
//! - [`logging`]: Structured JSON logging setup
//!
//! # Architecture
//!
//! Services are thin: they build their own routes and hand them to
//! [`service_router`], which adds the common endpoints and layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  MetricsLayer                                               │
//! │  attach_request_context  (X-Request-ID, request span)       │
//! │  read / write deadlines                                     │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ service routes (+ require_credential on /greet)       │  │
//! │  │ /health, /metrics                                     │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Testing Support
//!
//! The [`test_utils`] module binds routers on ephemeral ports and builds
//! configurations without touching the process environment. Enable the
//! `test-utils` feature to access it from dependent crates.

pub mod auth;
pub mod config;
mod context;
mod error;
mod health;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod middleware;
mod payload;
mod response;
mod state;
pub mod upstream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::extract::FromRef;
use axum::routing::get;
use axum::Router;

pub use auth::{
    require_credential, AuthOutcome, Authenticator, CredentialVerifier, StaticKeyVerifier,
    AUTH_HEADER,
};
pub use config::{ConfigError, ServiceConfig, ServiceRole};
pub use context::{attach_request_context, RequestContext, RequestId, REQUEST_ID_HEADER};
pub use error::ServiceError;
pub use health::{health, HealthStatus};
pub use lifecycle::{
    bind_listener, run_server, shutdown_signal, ClientAddr, LifecycleError, ServerTimeouts,
    ShutdownOutcome,
};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, metrics_handler, MetricsConfig, MetricsError};
pub use middleware::MetricsLayer;
pub use payload::Greeting;
pub use response::{encode_json, JSON_CONTENT_TYPE};
pub use state::AppState;
pub use upstream::{UpstreamClient, UpstreamError};

/// Add the endpoints and layers every service shares to `routes`.
///
/// Adds `GET /health`, the metrics endpoint when enabled, the read and write
/// deadlines, the request context (so every response carries
/// `X-Request-ID`), and HTTP metrics.
pub fn service_router<S>(
    routes: Router<S>,
    timeouts: &ServerTimeouts,
    metrics: &MetricsConfig,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    AppState: FromRef<S>,
{
    let mut router = routes.route("/health", get(health));
    if metrics.enabled {
        router = router.route(&metrics.path, get(metrics_handler));
    }

    timeouts
        .apply(router)
        .layer(axum::middleware::from_fn(attach_request_context))
        .layer(MetricsLayer)
}
