//! Aggregating HTTP service ("Service B").
//!
//! # Configuration
//!
//! - `PORT` - HTTP port (default: 8081)
//! - `SERVICE_A_URL` - Base address of the greet service (default: `http://service-a:8080`)
//! - `SERVICE_A_AUTH_KEY` - Shared secret sent as `X-Auth-Key` (default: `default-secret-key`)
//! - `SERVICE_A_TIMEOUT_SECS` - Per-call timeout for the greet service (default: 5)
//! - `LOG_LEVEL` - Minimum log level (default: info); `RUST_LOG` overrides
//! - `LOG_FORMAT` - Log format: json (default) or text
//! - `METRICS_ENABLED` - Set to `false` to disable `/metrics`

use tracing::{error, info, warn};

use duet_service_process::{router, ProcessState};
use duet_service_shared::config::DEFAULT_LOG_LEVEL;
use duet_service_shared::{
    bind_listener, init_logging, init_metrics, run_server, shutdown_signal, AppState,
    LoggingConfig, MetricsConfig, ServerTimeouts, ServiceConfig, ServiceRole, ShutdownOutcome,
    UpstreamClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::from_env(ServiceRole::Downstream);

    // Logging comes up first so configuration errors are reported through it.
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
    init_logging(&LoggingConfig::from_env().with_level(level).with_service("process"));

    let config = config.map_err(|e| {
        error!(error = %e, "invalid configuration");
        e
    })?;
    config.report_defaults();

    let metrics_config = MetricsConfig::from_env();
    if let Err(e) = init_metrics(&metrics_config) {
        warn!(error = %e, "failed to initialize metrics, continuing without metrics");
    }

    let upstream = config.require_upstream()?;
    let client = UpstreamClient::new(&upstream.base_url, &config.auth_key, upstream.timeout)
        .map_err(|e| {
            error!(error = %e, "failed to build upstream client");
            e
        })?;

    let port = config.port;
    let timeouts = ServerTimeouts::default();
    info!(
        port = port,
        service_a_url = %client.base_url(),
        upstream_timeout_secs = client.timeout().as_secs(),
        read_timeout_secs = timeouts.read.as_secs(),
        write_timeout_secs = timeouts.write.as_secs(),
        idle_timeout_secs = timeouts.idle.as_secs(),
        "Initializing server"
    );

    let state = ProcessState::new(AppState::new(config), client);
    let app = router(state, &timeouts, &metrics_config);

    let listener = bind_listener(port).await.map_err(|e| {
        error!(error = %e, port = port, "Server startup failed");
        e
    })?;

    let outcome = run_server(listener, app, timeouts, shutdown_signal()).await?;
    info!(outcome = ?outcome, "Service B shutdown complete");

    if outcome == ShutdownOutcome::Forced {
        return Err("server forced to shutdown".into());
    }
    Ok(())
}
