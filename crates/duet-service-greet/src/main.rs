//! Greeting HTTP service ("Service A").
//!
//! # Configuration
//!
//! - `PORT` - HTTP port (default: 8080)
//! - `AUTH_KEY` - Shared secret expected in `X-Auth-Key` (default: `default-secret-key`)
//! - `LOG_LEVEL` - Minimum log level (default: info); `RUST_LOG` overrides
//! - `LOG_FORMAT` - Log format: json (default) or text
//! - `METRICS_ENABLED` - Set to `false` to disable `/metrics`

use tracing::{error, info, warn};

use duet_service_greet::router;
use duet_service_shared::config::DEFAULT_LOG_LEVEL;
use duet_service_shared::{
    bind_listener, init_logging, init_metrics, run_server, shutdown_signal, AppState,
    LoggingConfig, MetricsConfig, ServerTimeouts, ServiceConfig, ServiceRole, ShutdownOutcome,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::from_env(ServiceRole::Upstream);

    // Logging comes up first so configuration errors are reported through it.
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
    init_logging(&LoggingConfig::from_env().with_level(level).with_service("greet"));

    let config = config.map_err(|e| {
        error!(error = %e, "invalid configuration");
        e
    })?;
    config.report_defaults();

    let metrics_config = MetricsConfig::from_env();
    if let Err(e) = init_metrics(&metrics_config) {
        warn!(error = %e, "failed to initialize metrics, continuing without metrics");
    }

    let port = config.port;
    let timeouts = ServerTimeouts::default();
    let app = router(AppState::new(config), &timeouts, &metrics_config);

    info!(
        port = port,
        read_timeout_secs = timeouts.read.as_secs(),
        write_timeout_secs = timeouts.write.as_secs(),
        idle_timeout_secs = timeouts.idle.as_secs(),
        "Initializing server"
    );

    let listener = bind_listener(port).await.map_err(|e| {
        error!(error = %e, port = port, "Server startup failed");
        e
    })?;

    let outcome = run_server(listener, app, timeouts, shutdown_signal()).await?;
    info!(outcome = ?outcome, "Service A shutdown complete");

    if outcome == ShutdownOutcome::Forced {
        return Err("server forced to shutdown".into());
    }
    Ok(())
}
