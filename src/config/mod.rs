//! Process configuration for the kettle binary
//!
//! Settings are loaded from environment variables or a TOML file and then
//! split into the coordinator, worker and status server configurations.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::coordinator::{CoordinatorConfig, ServerConfig};
use crate::worker::WorkerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Election and broadcast settings
    pub coordinator: CoordinatorConfig,

    /// Worker settings
    pub worker: WorkerConfig,

    /// Status server settings
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directives for this configuration
    ///
    /// `verbose` raises the crate and HTTP layers to `debug` whatever the
    /// configured level.
    pub fn filter_directives(&self, verbose: bool) -> String {
        if verbose {
            String::from("kettle=debug,tower_http=debug,info")
        } else {
            format!("kettle={},warn", self.level)
        }
    }
}

impl Settings {
    /// Whether diagnostic logging was asked for, here or on the command line
    pub fn verbose(&self, cli_verbose: bool) -> bool {
        cli_verbose || self.coordinator.verbose
    }

    /// `EnvFilter` directives for the process
    pub fn log_directives(&self, cli_verbose: bool) -> String {
        self.logging.filter_directives(self.verbose(cli_verbose))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        let parse_ms = |key: &str, current: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a number of milliseconds, got '{raw}'")),
                None => Ok(current),
            }
        };

        let coordinator = &mut settings.coordinator;
        if let Some(name) = lookup("KETTLE_NAME") {
            coordinator.name = name.clone();
            settings.worker.name = name;
        }
        coordinator.instance_id = lookup("KETTLE_INSTANCE_ID").or(coordinator.instance_id.take());
        coordinator.verbose = lookup("KETTLE_VERBOSE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(coordinator.verbose);
        if let Some(url) = lookup("KETTLE_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            coordinator.redis_url = url;
        }

        coordinator.lock_timeout_ms = parse_ms("KETTLE_LOCK_TIMEOUT_MS", coordinator.lock_timeout_ms)?;
        coordinator.lock_ttl_ms = parse_ms("KETTLE_LOCK_TTL_MS", coordinator.lock_ttl_ms)?;
        coordinator.renewal_interval_ms =
            parse_ms("KETTLE_RENEWAL_INTERVAL_MS", coordinator.renewal_interval_ms)?;
        coordinator.lock_op_timeout_ms =
            parse_ms("KETTLE_LOCK_OP_TIMEOUT_MS", coordinator.lock_op_timeout_ms)?;
        coordinator.collect_window_ms =
            parse_ms("KETTLE_COLLECT_WINDOW_MS", coordinator.collect_window_ms)?;
        coordinator.staleness_window_ms =
            parse_ms("KETTLE_STALENESS_WINDOW_MS", coordinator.staleness_window_ms)?;
        coordinator.prune_interval_ms =
            parse_ms("KETTLE_PRUNE_INTERVAL_MS", coordinator.prune_interval_ms)?;

        if let Some(worker_name) = lookup("KETTLE_WORKER_NAME") {
            settings.worker.worker_name = Some(worker_name);
        }

        if let Some(addr) = lookup("KETTLE_BIND_ADDRESS") {
            settings.server.bind_address = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid KETTLE_BIND_ADDRESS: {addr}"))?;
        }

        if let Some(level) = lookup("KETTLE_LOG_LEVEL") {
            settings.logging.level = level;
        }
        if let Some(format) = lookup("KETTLE_LOG_FORMAT") {
            settings.logging.format = format;
        }

        Ok(settings)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.coordinator
            .validate()
            .context("Invalid coordinator configuration")?;
        self.worker
            .validate()
            .context("Invalid worker configuration")?;

        if self.worker.name != self.coordinator.name {
            anyhow::bail!(
                "worker group '{}' does not match coordinator group '{}'",
                self.worker.name,
                self.coordinator.name
            );
        }

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            anyhow::bail!("unknown log level '{}'", self.logging.level);
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("log format must be 'text' or 'json', got '{}'", self.logging.format);
        }

        Ok(())
    }
}
