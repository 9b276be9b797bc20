//! Health check handler shared by both services.
//!
//! `GET /health` never authenticates and never calls another service; it
//! only reports that the process is up and serving.

use axum::{extract::State, http::StatusCode, response::Response};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::{RequestContext, RequestId};
use crate::response::encode_json;
use crate::AppState;

/// Liveness payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always "healthy" while the process can answer.
    pub status: String,

    /// RFC 3339 UTC timestamp, second precision.
    pub timestamp: String,

    /// Correlation id of this health request.
    pub request_id: String,

    /// Port the service is listening on.
    pub server_port: String,
}

impl HealthStatus {
    /// Create a healthy status stamped with the current time.
    pub fn healthy(request_id: &RequestId, port: u16) -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            request_id: request_id.to_string(),
            server_port: port.to_string(),
        }
    }
}

/// Liveness handler.
///
/// # Example
///
/// ```text
/// GET /health
/// {"status":"healthy","timestamp":"2025-01-01T00:00:00Z","request_id":"0194…","server_port":"8080"}
/// ```
pub async fn health(State(state): State<AppState>, ctx: RequestContext) -> Response {
    info!(
        request_id = %ctx.request_id(),
        client_ip = ctx.client_addr(),
        method = %ctx.method(),
        path = ctx.path(),
        "Health check received"
    );

    let status = HealthStatus::healthy(ctx.request_id(), state.port());
    let response = encode_json(&ctx, StatusCode::OK, &status);

    info!(
        request_id = %ctx.request_id(),
        processing_time_ms = ctx.elapsed_ms(),
        "Health check completed"
    );
    response
}
