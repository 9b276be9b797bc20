//! The process service against a live greet service and scripted upstreams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, HeaderName, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use axum_test::{TestResponse, TestServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use duet_service_process::{router, CombinedResponse, ProcessState, LOCAL_MESSAGE};
use duet_service_shared::test_utils::{
    config_with, greet_config, process_config, spawn_router, unused_local_addr, TEST_AUTH_KEY,
};
use duet_service_shared::{
    AppState, Greeting, HealthStatus, MetricsConfig, RequestId, ServerTimeouts, ServiceConfig,
    ServiceRole, UpstreamClient, AUTH_HEADER, REQUEST_ID_HEADER,
};

fn process_server(config: ServiceConfig, timeout: Option<Duration>) -> TestServer {
    let upstream = config.upstream().unwrap().clone();
    let client = UpstreamClient::new(
        upstream.base_url,
        config.auth_key.clone(),
        timeout.unwrap_or(upstream.timeout),
    )
    .unwrap();

    let state = ProcessState::new(AppState::new(config), client);
    let app = router(state, &ServerTimeouts::default(), &MetricsConfig::default());
    TestServer::new(app).unwrap()
}

async fn spawn_greet(config: ServiceConfig) -> std::net::SocketAddr {
    let app = duet_service_greet::router(
        AppState::new(config),
        &ServerTimeouts::default(),
        &MetricsConfig::default(),
    );
    spawn_router(app).await
}

fn request_id(response: &TestResponse) -> String {
    response
        .header(REQUEST_ID_HEADER)
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_process_merges_greeting() {
    let upstream = spawn_greet(greet_config()).await;
    let server = process_server(process_config(upstream), None);

    let response = server.get("/process").await;

    response.assert_status_ok();
    assert_eq!(response.header(CONTENT_TYPE), "application/json");

    let combined: CombinedResponse = response.json();
    assert_eq!(combined.service_a_message, duet_service_greet::GREETING);
    assert_eq!(combined.service_b_message, LOCAL_MESSAGE);
    assert_eq!(combined.request_id, request_id(&response));
}

#[tokio::test]
async fn test_process_surfaces_upstream_rejection() {
    let rotated = config_with(ServiceRole::Upstream, &[("AUTH_KEY", "other-key")]);
    let upstream = spawn_greet(rotated).await;
    let server = process_server(process_config(upstream), None);

    let response = server.get("/process").await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    response.assert_text("Service A request failed");
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
}

#[tokio::test]
async fn test_process_unreachable_upstream_is_503() {
    let server = process_server(process_config(unused_local_addr().await), None);

    let response = server.get("/process").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    response.assert_text("Failed to call Service A");
    assert_eq!(request_id(&response).len(), 36);
}

#[tokio::test]
async fn test_process_slow_upstream_times_out() {
    let slow = Router::new().route(
        "/greet",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "too late"
        }),
    );
    let upstream = spawn_router(slow).await;
    let server = process_server(process_config(upstream), Some(Duration::from_millis(200)));

    let response = server.get("/process").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    response.assert_text("Failed to call Service A");
}

#[tokio::test]
async fn test_process_propagates_upstream_status() {
    for status in [StatusCode::IM_A_TEAPOT, StatusCode::INTERNAL_SERVER_ERROR] {
        let failing = Router::new().route("/greet", get(move || async move { status }));
        let upstream = spawn_router(failing).await;
        let server = process_server(process_config(upstream), None);

        let response = server.get("/process").await;

        response.assert_status(status);
        response.assert_text("Service A request failed");
    }
}

#[tokio::test]
async fn test_process_malformed_upstream_body_is_500() {
    let malformed = Router::new().route(
        "/greet",
        get(|| async { ([(CONTENT_TYPE, "application/json")], "{\"message\": ") }),
    );
    let upstream = spawn_router(malformed).await;
    let server = process_server(process_config(upstream), None);

    let response = server.get("/process").await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    response.assert_text("Failed to parse Service A response");
}

#[tokio::test]
async fn test_process_truncated_upstream_body_is_500() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request).await;
        let _ = stream
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: application/json\r\n\
                  Content-Length: 500\r\n\r\n\
                  {\"message\": \"cut",
            )
            .await;
        // Closing here leaves most of the declared body unsent.
    });
    let server = process_server(process_config(upstream), None);

    let response = server.get("/process").await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    response.assert_text("Failed to read Service A response");
}

#[tokio::test]
async fn test_process_invalid_upstream_address_is_500() {
    let config = config_with(
        ServiceRole::Downstream,
        &[("SERVICE_A_URL", "http://exa mple:8080")],
    );
    let server = process_server(config, None);

    let response = server.get("/process").await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    response.assert_text("Failed to create request to Service A");
}

#[derive(Clone, Default)]
struct Captured {
    request_id: Arc<Mutex<Option<String>>>,
    auth_key: Arc<Mutex<Option<String>>>,
}

async fn capturing_greet(State(seen): State<Captured>, headers: HeaderMap) -> Json<Greeting> {
    let header = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    *seen.request_id.lock().unwrap() = header(&REQUEST_ID_HEADER);
    *seen.auth_key.lock().unwrap() = header(&AUTH_HEADER);

    Json(Greeting::new("scripted", &RequestId::new("upstream-own-id")))
}

#[tokio::test]
async fn test_process_forwards_request_id_and_key() {
    let seen = Captured::default();
    let scripted = Router::new()
        .route("/greet", get(capturing_greet))
        .with_state(seen.clone());
    let upstream = spawn_router(scripted).await;
    let server = process_server(process_config(upstream), None);

    let response = server.get("/process").await;
    response.assert_status_ok();

    let forwarded = seen.request_id.lock().unwrap().clone();
    assert_eq!(forwarded, Some(request_id(&response)));
    assert_eq!(
        seen.auth_key.lock().unwrap().as_deref(),
        Some(TEST_AUTH_KEY)
    );

    // The merged body reports this service's id, not the upstream's.
    let combined: CombinedResponse = response.json();
    assert_eq!(combined.service_a_message, "scripted");
    assert_eq!(combined.request_id, request_id(&response));
}

#[tokio::test]
async fn test_health_does_not_call_upstream() {
    let server = process_server(process_config(unused_local_addr().await), None);

    let response = server.get("/health").await;

    response.assert_status_ok();
    let health: HealthStatus = response.json();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.server_port, "8081");
    assert_eq!(health.request_id, request_id(&response));
}
