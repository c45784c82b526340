// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use crate::model::ObjectKey;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "cattle-system";
const DEFAULT_NAME: &str = "rancherlogging";
const DEFAULT_PROVIDER: &str = "fluentd";
const DEFAULT_SECRET_PATH: &str = "/fluentd/etc/k8ssecret/loggingsecret";
const DEFAULT_CONFIG_DIR: &str = "/fluentd/etc";
const DEFAULT_PLUGINS_DIR: &str = "/fluentd/etc/plugins";
const DEFAULT_FORWARDER_BIN: &str = "fluentd";

/// Configuration for the logging controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace holding the Logging resource
    pub namespace: String,
    /// Name of the Logging resource driving the forwarder
    pub name: String,
    /// Provider looked up in the registry at startup
    pub provider: String,
    /// Mounted secret file with target credentials
    pub secret_path: PathBuf,
    /// Directory holding the active config, its backup, the PID file and logs
    pub config_dir: PathBuf,
    pub plugins_dir: PathBuf,
    /// Forwarder executable
    pub forwarder_bin: String,
    pub start_timeout: Duration,
    pub start_attempts: u32,
    /// How often every cached key is re-enqueued
    pub resync_period: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Explicit kubeconfig path; in-cluster or `KUBECONFIG` inference otherwise
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: DEFAULT_NAME.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            secret_path: PathBuf::from(DEFAULT_SECRET_PATH),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            forwarder_bin: DEFAULT_FORWARDER_BIN.to_string(),
            start_timeout: Duration::from_secs(60),
            start_attempts: 3,
            resync_period: Duration::from_secs(5 * 60),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(5 * 60),
            log_level: "info".to_string(),
            kubeconfig: None,
        }
    }
}

impl ControllerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            namespace: env::var("LOGGING_NAMESPACE").unwrap_or(defaults.namespace),
            name: env::var("LOGGING_NAME").unwrap_or(defaults.name),
            provider: env::var("LOGGING_PROVIDER").unwrap_or(defaults.provider),
            secret_path: env::var("LOGGING_SECRET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.secret_path),
            config_dir: env::var("LOGGING_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            plugins_dir: env::var("LOGGING_PLUGINS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugins_dir),
            forwarder_bin: env::var("LOGGING_FORWARDER_BIN").unwrap_or(defaults.forwarder_bin),
            start_timeout: parse_env("LOGGING_START_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.start_timeout),
            start_attempts: parse_env("LOGGING_START_ATTEMPTS")?.unwrap_or(defaults.start_attempts),
            resync_period: parse_env("LOGGING_RESYNC_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.resync_period),
            retry_base: parse_env("LOGGING_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base),
            retry_max: parse_env("LOGGING_RETRY_MAX_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_max),
            log_level: env::var("LOGGING_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            kubeconfig: env::var("LOGGING_KUBECONFIG")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() || self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LOGGING_NAMESPACE and LOGGING_NAME cannot be empty".to_string(),
            ));
        }

        if self.secret_path.file_name().is_none() {
            return Err(ConfigError::Invalid(format!(
                "LOGGING_SECRET_PATH '{}' must name a file",
                self.secret_path.display()
            )));
        }

        if self.start_attempts == 0 {
            return Err(ConfigError::Invalid(
                "LOGGING_START_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        if self.start_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "LOGGING_START_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.retry_base.is_zero() || self.retry_base > self.retry_max {
            return Err(ConfigError::Invalid(format!(
                "retry base {:?} must be non-zero and not exceed retry max {:?}",
                self.retry_base, self.retry_max
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Key of the single Logging object this controller manages.
    pub fn watched_key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}
