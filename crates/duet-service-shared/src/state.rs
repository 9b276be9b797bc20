//! Application state shared by every handler.

use std::sync::Arc;

use crate::config::ServiceConfig;

/// Read-only state shared across all requests.
///
/// This struct is cheaply cloneable (using `Arc` internally) and should be
/// shared via axum's `State` extractor. Services with extra state embed it and
/// implement `FromRef` so shared handlers such as [`crate::health`] still
/// extract it.
///
/// # Example
///
/// ```ignore
/// use axum::{Router, routing::get};
/// use duet_service_shared::{health, AppState, ServiceConfig, ServiceRole};
///
/// let state = AppState::new(ServiceConfig::from_env(ServiceRole::Upstream)?);
/// let app = Router::new()
///     .route("/health", get(health))
///     .with_state(state);
/// ```
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Access the loaded configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Port the service listens on.
    pub fn port(&self) -> u16 {
        self.config.port
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("role", &self.config.role)
            .field("port", &self.config.port)
            .finish()
    }
}
