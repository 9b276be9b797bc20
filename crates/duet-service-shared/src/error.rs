//! Request-level error taxonomy and its plain-text HTTP rendering.
//!
//! Errors are surfaced to callers as a status code plus a short plain-text
//! body; the full detail only goes to the log, tagged with the correlation id.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::context::RequestContext;
use crate::upstream::UpstreamError;

/// Errors that end a request early.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The credential was missing or did not match.
    #[error("missing or invalid credential")]
    Unauthorized,

    /// The call to the upstream service failed at some stage.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The response value could not be serialised.
    #[error("failed to encode response: {0}")]
    Encoding(#[source] serde_json::Error),

    /// The handler did not produce a response within the write timeout.
    #[error("handler did not respond within {}ms", .limit.as_millis())]
    WriteTimeout { limit: Duration },
}

impl ServiceError {
    /// Status code returned to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Upstream(err) => err.status_code(),
            Self::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::WriteTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Summary used as the log message.
    pub fn log_message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Authentication failed",
            Self::Upstream(err) => err.summary(),
            Self::Encoding(_) => "Failed to encode response",
            Self::WriteTimeout { .. } => "Handler exceeded write timeout",
        }
    }

    /// Plain-text body returned to the caller.
    pub fn body(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Upstream(err) => err.summary(),
            Self::Encoding(_) => "Internal Server Error",
            Self::WriteTimeout { .. } => self.log_message(),
        }
    }

    /// Render the error without logging it.
    pub fn to_response(&self, ctx: &RequestContext) -> Response {
        let mut response = (self.status_code(), self.body()).into_response();
        ctx.stamp(response.headers_mut());
        response
    }

    /// Log the error with the request's context, then render it.
    pub fn report(&self, ctx: &RequestContext) -> Response {
        let status = self.status_code();

        tracing::error!(
            error = %self,
            request_id = %ctx.request_id(),
            client_ip = ctx.client_addr(),
            method = %ctx.method(),
            path = ctx.path(),
            status_code = status.as_u16(),
            processing_time_ms = ctx.elapsed_ms(),
            "{}",
            self.log_message()
        );

        self.to_response(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header::CONTENT_TYPE, Method};

    use crate::context::REQUEST_ID_HEADER;

    fn ctx() -> RequestContext {
        RequestContext::new("unknown", Method::GET, "/process")
    }

    fn encoding_error() -> serde_json::Error {
        serde_json::from_str::<serde_json::Value>("{").unwrap_err()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ServiceError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServiceError::Encoding(encoding_error()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::from(UpstreamError::Status {
                status: StatusCode::IM_A_TEAPOT
            })
            .status_code(),
            StatusCode::IM_A_TEAPOT
        );
    }

    #[test]
    fn test_upstream_body_matches_log_message() {
        let err = ServiceError::from(UpstreamError::Status {
            status: StatusCode::BAD_GATEWAY,
        });
        assert_eq!(err.body(), err.log_message());
        assert_eq!(err.body(), "Service A request failed");
    }

    #[test]
    fn test_write_timeout_body_matches_log_message() {
        let err = ServiceError::WriteTimeout {
            limit: Duration::from_secs(10),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.body(), err.log_message());
        assert!(err.to_string().contains("10000ms"));
    }

    #[test]
    fn test_encoding_error_hides_detail() {
        let err = ServiceError::Encoding(encoding_error());
        assert_eq!(err.body(), "Internal Server Error");
        assert!(err.to_string().starts_with("failed to encode response"));
    }

    #[test]
    fn test_to_response_is_plain_text_with_request_id() {
        let ctx = ctx();
        let response = ServiceError::Unauthorized.to_response(&ctx);

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap(),
            ctx.request_id().as_str()
        );
    }

    #[test]
    fn test_report_uses_mapped_status() {
        let err = ServiceError::from(UpstreamError::Status {
            status: StatusCode::NOT_FOUND,
        });
        assert_eq!(err.report(&ctx()).status(), StatusCode::NOT_FOUND);
    }
}
