//! Greeting service ("Service A").
//!
//! # Endpoints
//!
//! - `GET /greet` - Greeting for callers presenting the shared secret in `X-Auth-Key`
//! - `GET /health` - Liveness probe, no authentication
//! - `GET /metrics` - Prometheus metrics endpoint

use axum::{http::StatusCode, middleware, response::Response, routing::get, Router};
use tracing::info;

use duet_service_shared::{
    encode_json, require_credential, service_router, AppState, Authenticator, Greeting,
    MetricsConfig, RequestContext, ServerTimeouts,
};

/// Message returned by `/greet`.
pub const GREETING: &str = "Hello from Service A!";

/// Build the greet service router.
///
/// Only `/greet` is authenticated, for every method; `/health` and
/// `/metrics` stay open.
pub fn router(state: AppState, timeouts: &ServerTimeouts, metrics: &MetricsConfig) -> Router {
    let authenticator = Authenticator::static_key(state.config().auth_key.clone());

    let routes = Router::new()
        .route("/greet", get(greet_handler))
        .route_layer(middleware::from_fn_with_state(
            authenticator,
            require_credential,
        ));

    service_router(routes, timeouts, metrics).with_state(state)
}

/// Handle GET /greet requests that passed authentication.
async fn greet_handler(ctx: RequestContext) -> Response {
    info!(
        request_id = %ctx.request_id(),
        client_ip = ctx.client_addr(),
        method = %ctx.method(),
        path = ctx.path(),
        "Processing greeting request"
    );

    let greeting = Greeting::new(GREETING, ctx.request_id());
    let response = encode_json(&ctx, StatusCode::OK, &greeting);

    if response.status() == StatusCode::OK {
        info!(
            request_id = %ctx.request_id(),
            processing_time_ms = ctx.elapsed_ms(),
            "Greeting request processed successfully"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::{HeaderValue, Method};
    use axum_test::TestServer;
    use duet_service_shared::test_utils::{greet_config, TEST_AUTH_KEY};
    use duet_service_shared::{RequestId, AUTH_HEADER, REQUEST_ID_HEADER};

    fn server() -> TestServer {
        let app = router(
            AppState::new(greet_config()),
            &ServerTimeouts::default(),
            &MetricsConfig::default(),
        );
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn test_greet_handler_body_matches_context() {
        let ctx = RequestContext::new("127.0.0.1:5000", Method::GET, "/greet");
        let response = greet_handler(ctx.clone()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            ctx.request_id().as_str()
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let greeting: Greeting = serde_json::from_slice(&body).unwrap();
        assert_eq!(greeting.message, GREETING);
        assert_eq!(RequestId::new(greeting.request_id), *ctx.request_id());
    }

    #[tokio::test]
    async fn test_router_guards_only_greet() {
        let server = server();

        server
            .get("/greet")
            .add_header(AUTH_HEADER, HeaderValue::from_static("nope"))
            .await
            .assert_status_unauthorized();
        server
            .get("/greet")
            .add_header(AUTH_HEADER, HeaderValue::from_static(TEST_AUTH_KEY))
            .await
            .assert_status_ok();
        server.get("/health").await.assert_status_ok();
        server.get("/metrics").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_other_methods_are_authenticated_first() {
        let server = server();

        server.post("/greet").await.assert_status_unauthorized();
        server
            .post("/greet")
            .add_header(AUTH_HEADER, HeaderValue::from_static(TEST_AUTH_KEY))
            .await
            .assert_status(StatusCode::METHOD_NOT_ALLOWED);
    }
}
