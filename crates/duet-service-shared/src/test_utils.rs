//! Test utilities for service handler testing.
//!
//! Integration tests run real routers on ephemeral local ports so the
//! process service can call a live greet service over HTTP.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::{ServiceConfig, ServiceRole};
use crate::lifecycle::ClientAddr;

/// Shared secret used by tests on both sides.
pub const TEST_AUTH_KEY: &str = "service-a-secret-key";

/// Serve `router` on `127.0.0.1:0` in the background.
///
/// The server runs until the test runtime shuts down. Handlers can extract
/// `ConnectInfo<ClientAddr>`.
///
/// # Panics
///
/// Panics if no local port can be bound.
pub async fn spawn_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("failed to bind test listener: {}", e));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|e| panic!("failed to read test listener address: {}", e));

    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<ClientAddr>(),
        )
        .await;
    });

    addr
}

/// An address nothing is listening on.
///
/// Binds an ephemeral port and releases it immediately.
pub async fn unused_local_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("failed to bind test listener: {}", e));
    listener
        .local_addr()
        .unwrap_or_else(|e| panic!("failed to read test listener address: {}", e))
}

/// Build a configuration from explicit variables only.
///
/// # Panics
///
/// Panics if the variables do not form a valid configuration.
pub fn config_with(role: ServiceRole, vars: &[(&str, &str)]) -> ServiceConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ServiceConfig::from_lookup(role, |name| vars.get(name).cloned())
        .unwrap_or_else(|e| panic!("invalid test configuration: {}", e))
}

/// Greet service configuration expecting [`TEST_AUTH_KEY`].
pub fn greet_config() -> ServiceConfig {
    config_with(ServiceRole::Upstream, &[("AUTH_KEY", TEST_AUTH_KEY)])
}

/// Process service configuration pointing at `upstream` with [`TEST_AUTH_KEY`].
pub fn process_config(upstream: SocketAddr) -> ServiceConfig {
    let url = format!("http://{}", upstream);
    config_with(
        ServiceRole::Downstream,
        &[
            ("SERVICE_A_URL", url.as_str()),
            ("SERVICE_A_AUTH_KEY", TEST_AUTH_KEY),
        ],
    )
}
