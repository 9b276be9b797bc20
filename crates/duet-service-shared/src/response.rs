//! JSON response encoding.
//!
//! The body is serialised into a buffer before any status or header is set,
//! so a serialisation failure can still become a clean 500.

use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::context::RequestContext;
use crate::error::ServiceError;

/// Content type for successful responses.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encode `value` as a JSON response with the request's correlation id.
///
/// Falls back to `500 Internal Server Error` (plain text, logged with the
/// request's context) when `value` cannot be serialised.
///
/// # Example
///
/// ```
/// use axum::http::{Method, StatusCode};
/// use duet_service_shared::{encode_json, RequestContext};
///
/// let ctx = RequestContext::new("unknown", Method::GET, "/health");
/// let response = encode_json(&ctx, StatusCode::OK, &serde_json::json!({"status": "healthy"}));
/// assert_eq!(response.status(), StatusCode::OK);
/// ```
pub fn encode_json<T: Serialize + ?Sized>(
    ctx: &RequestContext,
    status: StatusCode,
    value: &T,
) -> Response {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => return ServiceError::Encoding(err).report(ctx),
    };

    let mut response = (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE))],
        body,
    )
        .into_response();
    ctx.stamp(response.headers_mut());
    response
}
