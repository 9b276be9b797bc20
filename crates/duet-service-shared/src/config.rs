//! Environment-sourced service configuration.
//!
//! Configuration is read once at startup and never changes afterwards.
//! Absent (or empty) variables fall back to defaults; which ones did is
//! remembered so [`ServiceConfig::report_defaults`] can log them once the
//! logging system is up.
//!
//! # Environment Variables
//!
//! | variable | role | default |
//! |----------|------|---------|
//! | `PORT` | both | `8080` upstream, `8081` downstream |
//! | `LOG_LEVEL` | both | `info` |
//! | `AUTH_KEY` | upstream | `default-secret-key` |
//! | `SERVICE_A_URL` | downstream | `http://service-a:8080` |
//! | `SERVICE_A_AUTH_KEY` | downstream | `default-secret-key` |
//! | `SERVICE_A_TIMEOUT_SECS` | downstream | `5` |

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::auth::mask_secret;
use crate::upstream::DEFAULT_UPSTREAM_TIMEOUT;

/// Shared secret used when none is configured.
pub const DEFAULT_AUTH_KEY: &str = "default-secret-key";

/// Upstream address used when none is configured.
pub const DEFAULT_UPSTREAM_URL: &str = "http://service-a:8080";

/// Minimum log severity used when none is configured.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const PORT_VAR: &str = "PORT";
const LOG_LEVEL_VAR: &str = "LOG_LEVEL";
const UPSTREAM_URL_VAR: &str = "SERVICE_A_URL";
const UPSTREAM_TIMEOUT_VAR: &str = "SERVICE_A_TIMEOUT_SECS";

/// Which side of the interaction a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    /// Authenticates callers and serves greetings.
    Upstream,
    /// Calls the upstream and merges its answer.
    Downstream,
}

impl ServiceRole {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Upstream => 8080,
            Self::Downstream => 8081,
        }
    }

    /// Variable holding the shared secret for this role.
    pub fn auth_key_var(self) -> &'static str {
        match self {
            Self::Upstream => "AUTH_KEY",
            Self::Downstream => "SERVICE_A_AUTH_KEY",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Upstream => "Service A",
            Self::Downstream => "Service B",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A setting that was not configured and fell back to its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Defaulted {
    Port,
    AuthKey,
    UpstreamUrl,
}

/// Where the downstream service finds the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub timeout: Duration,
}

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: expected a TCP port")]
    InvalidPort { var: &'static str, value: String },

    #[error("invalid value {value:?} for {var}: expected a positive whole number of seconds")]
    InvalidTimeout { var: &'static str, value: String },

    #[error("{0} has no upstream configured")]
    MissingUpstream(ServiceRole),
}

/// Immutable configuration for one service process.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub role: ServiceRole,
    pub port: u16,
    pub log_level: String,
    pub auth_key: String,
    upstream: Option<UpstreamSettings>,
    defaulted: Vec<Defaulted>,
}

impl ServiceConfig {
    /// Load configuration for `role` from the process environment.
    pub fn from_env(role: ServiceRole) -> Result<Self, ConfigError> {
        Self::from_lookup(role, |name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated as absent.
    pub fn from_lookup<F>(role: ServiceRole, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let mut defaulted = Vec::new();

        let port = match get(PORT_VAR) {
            Some(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                var: PORT_VAR,
                value,
            })?,
            None => {
                defaulted.push(Defaulted::Port);
                role.default_port()
            }
        };

        let log_level = get(LOG_LEVEL_VAR).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let auth_key = get(role.auth_key_var()).unwrap_or_else(|| {
            defaulted.push(Defaulted::AuthKey);
            DEFAULT_AUTH_KEY.to_string()
        });

        let upstream = match role {
            ServiceRole::Upstream => None,
            ServiceRole::Downstream => {
                let base_url = get(UPSTREAM_URL_VAR).unwrap_or_else(|| {
                    defaulted.push(Defaulted::UpstreamUrl);
                    DEFAULT_UPSTREAM_URL.to_string()
                });

                let timeout = match get(UPSTREAM_TIMEOUT_VAR) {
                    Some(value) => match value.parse::<u64>() {
                        Ok(secs) if secs > 0 => Duration::from_secs(secs),
                        _ => {
                            return Err(ConfigError::InvalidTimeout {
                                var: UPSTREAM_TIMEOUT_VAR,
                                value,
                            })
                        }
                    },
                    None => DEFAULT_UPSTREAM_TIMEOUT,
                };

                Some(UpstreamSettings { base_url, timeout })
            }
        };

        Ok(Self {
            role,
            port,
            log_level,
            auth_key,
            upstream,
            defaulted,
        })
    }

    /// Upstream location; present only for [`ServiceRole::Downstream`].
    pub fn upstream(&self) -> Option<&UpstreamSettings> {
        self.upstream.as_ref()
    }

    /// Like [`upstream`](Self::upstream), but an error for roles without one.
    pub fn require_upstream(&self) -> Result<&UpstreamSettings, ConfigError> {
        self.upstream
            .as_ref()
            .ok_or(ConfigError::MissingUpstream(self.role))
    }

    /// Settings that fell back to defaults.
    pub fn defaulted(&self) -> &[Defaulted] {
        &self.defaulted
    }

    /// Log every defaulted setting. Call after logging is initialised.
    pub fn report_defaults(&self) {
        for setting in &self.defaulted {
            match setting {
                Defaulted::Port => {
                    info!(default_port = self.port, "No port specified, using default");
                }
                Defaulted::AuthKey => {
                    warn!(
                        default_key = %mask_secret(&self.auth_key),
                        "No authentication key provided, using default. This is NOT recommended for production!"
                    );
                }
                Defaulted::UpstreamUrl => {
                    if let Some(upstream) = &self.upstream {
                        warn!(
                            default_url = %upstream.base_url,
                            "No upstream URL specified, using default"
                        );
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("role", &self.role)
            .field("port", &self.port)
            .field("log_level", &self.log_level)
            .field("auth_key", &mask_secret(&self.auth_key))
            .field("upstream", &self.upstream)
            .field("defaulted", &self.defaulted)
            .finish()
    }
}
