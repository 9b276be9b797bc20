//! Aggregating service ("Service B").
//!
//! `/process` calls the greet service's `/greet` with the shared secret and
//! the current correlation id, then answers with both services' messages.
//!
//! # Endpoints
//!
//! - `GET /process` - Call the greet service and merge its answer
//! - `GET /health` - Liveness probe
//! - `GET /metrics` - Prometheus metrics endpoint

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use duet_service_shared::{
    encode_json, service_router, AppState, Greeting, MetricsConfig, RequestContext,
    ServerTimeouts, ServiceError, UpstreamClient,
};

/// This service's own message.
pub const LOCAL_MESSAGE: &str = "Hello from Service B!";

/// Path of the greeting endpoint on the greet service.
pub const GREETING_PATH: &str = "/greet";

/// State for the process service: shared state plus the upstream client.
#[derive(Debug, Clone)]
pub struct ProcessState {
    app: AppState,
    upstream: UpstreamClient,
}

impl ProcessState {
    pub fn new(app: AppState, upstream: UpstreamClient) -> Self {
        Self { app, upstream }
    }
}

impl FromRef<ProcessState> for AppState {
    fn from_ref(state: &ProcessState) -> Self {
        state.app.clone()
    }
}

impl FromRef<ProcessState> for UpstreamClient {
    fn from_ref(state: &ProcessState) -> Self {
        state.upstream.clone()
    }
}

/// Body of a successful `GET /process`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResponse {
    pub service_a_message: String,
    pub service_b_message: String,

    /// This service's correlation id, not the greet service's.
    pub request_id: String,

    pub timestamp: DateTime<Utc>,
}

impl CombinedResponse {
    fn merge(greeting: Greeting, ctx: &RequestContext) -> Self {
        Self {
            service_a_message: greeting.message,
            service_b_message: LOCAL_MESSAGE.to_string(),
            request_id: ctx.request_id().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Build the process service router.
pub fn router(state: ProcessState, timeouts: &ServerTimeouts, metrics: &MetricsConfig) -> Router {
    let routes = Router::new().route("/process", get(process_handler));

    service_router(routes, timeouts, metrics).with_state(state)
}

/// Handle GET /process requests.
async fn process_handler(State(upstream): State<UpstreamClient>, ctx: RequestContext) -> Response {
    info!(
        request_id = %ctx.request_id(),
        client_ip = ctx.client_addr(),
        method = %ctx.method(),
        path = ctx.path(),
        upstream_url = upstream.base_url(),
        "Processing service interaction request"
    );

    let greeting: Greeting = match upstream.fetch_json(&ctx, GREETING_PATH).await {
        Ok(greeting) => greeting,
        Err(e) => return ServiceError::from(e).report(&ctx),
    };
    let service_a_request_id = greeting.request_id.clone();

    info!(
        request_id = %ctx.request_id(),
        service_a_message = %greeting.message,
        "Preparing response"
    );

    let combined = CombinedResponse::merge(greeting, &ctx);
    let response = encode_json(&ctx, StatusCode::OK, &combined);

    if response.status() == StatusCode::OK {
        info!(
            request_id = %ctx.request_id(),
            service_a_request_id = %service_a_request_id,
            processing_time_ms = ctx.elapsed_ms(),
            "Process request completed successfully"
        );
    }
    response
}
