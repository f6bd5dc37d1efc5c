//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::lock::resource_name;
use crate::protocol::Channels;
use crate::utils::short_id;

/// Default group name
pub const DEFAULT_NAME: &str = "kettle";

/// Default lock hold budget (ms)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Default lock TTL (ms); one second under the hold budget
pub const DEFAULT_LOCK_TTL_MS: u64 = 29_000;

/// Configuration for a Coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Group name; derives the lock resource and channel names
    pub name: String,

    /// Process-unique identifier; generated when absent
    pub instance_id: Option<String>,

    /// Enable diagnostic logging of protocol noise
    pub verbose: bool,

    /// Redis URL for the default lock and bus
    pub redis_url: String,

    /// Lock hold budget in milliseconds
    pub lock_timeout_ms: u64,

    /// Lock TTL in milliseconds
    pub lock_ttl_ms: u64,

    /// Election cycle period in milliseconds
    pub renewal_interval_ms: u64,

    /// Upper bound on a single acquire/renew/release call in milliseconds
    pub lock_op_timeout_ms: u64,

    /// Default broadcast collection window in milliseconds
    pub collect_window_ms: u64,

    /// Workers unseen for longer than this are pruned (ms)
    pub staleness_window_ms: u64,

    /// Pruner period in milliseconds
    pub prune_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            instance_id: None,
            verbose: false,
            redis_url: "redis://localhost:6379".to_string(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            renewal_interval_ms: 10_000,
            lock_op_timeout_ms: 5_000,
            collect_window_ms: 5_000,
            staleness_window_ms: 90_000,
            prune_interval_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new config builder
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                reason: "Group name must not be empty".to_string(),
            });
        }

        if self.lock_ttl_ms == 0 || self.lock_ttl_ms >= self.lock_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "lock_ttl_ms".to_string(),
                reason: "TTL must be positive and shorter than the lock hold budget".to_string(),
            });
        }

        if self.renewal_interval_ms == 0
            || self.renewal_interval_ms.saturating_add(self.safety_margin_ms()) >= self.lock_ttl_ms
        {
            return Err(ConfigError::InvalidValue {
                field: "renewal_interval_ms".to_string(),
                reason: "Renewal interval plus safety margin must be shorter than the TTL"
                    .to_string(),
            });
        }

        if self.lock_op_timeout_ms == 0 || self.lock_op_timeout_ms >= self.renewal_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "lock_op_timeout_ms".to_string(),
                reason: "Lock call timeout must be shorter than the renewal interval".to_string(),
            });
        }

        for (field, value) in [
            ("collect_window_ms", self.collect_window_ms),
            ("staleness_window_ms", self.staleness_window_ms),
            ("prune_interval_ms", self.prune_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "Must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    fn safety_margin_ms(&self) -> u64 {
        self.lock_timeout_ms.saturating_sub(self.lock_ttl_ms)
    }

    /// Instance id, generating `{name}-{random}` when none was configured
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, short_id()))
    }

    /// Lock resource contended by this group
    pub fn lock_resource(&self) -> String {
        resource_name(&self.name)
    }

    /// Channels used by this group
    pub fn channels(&self) -> Channels {
        Channels::for_group(&self.name)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// Gap kept between the TTL and the hold budget
    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms())
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    pub fn lock_op_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_op_timeout_ms)
    }

    pub fn collect_window(&self) -> Duration {
        Duration::from_millis(self.collect_window_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Set group name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set instance id
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.config.instance_id = Some(id.into());
        self
    }

    /// Enable/disable verbose diagnostics
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Set Redis URL
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = url.into();
        self
    }

    /// Set lock hold budget and TTL
    pub fn lock_timing(mut self, timeout: Duration, ttl: Duration) -> Self {
        self.config.lock_timeout_ms = timeout.as_millis() as u64;
        self.config.lock_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set election cycle period
    pub fn renewal_interval(mut self, interval: Duration) -> Self {
        self.config.renewal_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-call lock timeout
    pub fn lock_op_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_op_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set default collection window
    pub fn collect_window(mut self, window: Duration) -> Self {
        self.config.collect_window_ms = window.as_millis() as u64;
        self
    }

    /// Set roster staleness window
    pub fn staleness_window(mut self, window: Duration) -> Self {
        self.config.staleness_window_ms = window.as_millis() as u64;
        self
    }

    /// Set pruner period
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.config.prune_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Build the config
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("{0}")]
    Invalid(String),

    /// A required dependency could not be constructed
    #[error("Dependency '{dependency}' unavailable: {reason}")]
    Unavailable { dependency: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_ttl(), Duration::from_secs(29));
        assert_eq!(config.safety_margin(), Duration::from_secs(1));
        assert_eq!(config.lock_resource(), "kettle-distlocker");
        assert_eq!(config.channels().commands, "kettle-commands");
    }

    #[test]
    fn test_config_builder() {
        let config = CoordinatorConfig::builder()
            .name("ingest")
            .instance_id("ingest-a")
            .lock_timing(Duration::from_millis(600), Duration::from_millis(500))
            .renewal_interval(Duration::from_millis(100))
            .lock_op_timeout(Duration::from_millis(50))
            .collect_window(Duration::from_millis(200))
            .build()
            .unwrap();

        assert_eq!(config.name, "ingest");
        assert_eq!(config.resolve_instance_id(), "ingest-a");
        assert_eq!(config.renewal_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_generated_instance_id() {
        let config = CoordinatorConfig::default();
        let a = config.resolve_instance_id();
        let b = config.resolve_instance_id();

        assert!(a.starts_with("kettle-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_ttl_must_fit_hold_budget() {
        let result = CoordinatorConfig::builder()
            .lock_timing(Duration::from_secs(30), Duration::from_secs(30))
            .build();

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "lock_ttl_ms"
        ));
    }

    #[test]
    fn test_renewal_must_leave_margin() {
        // 28.5s + 1s margin reaches past the 29s TTL
        let result = CoordinatorConfig::builder()
            .renewal_interval(Duration::from_millis(28_500))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_huge_renewal_interval_rejected() {
        let mut config = CoordinatorConfig::default();
        config.renewal_interval_ms = u64::MAX;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "renewal_interval_ms"
        ));
    }

    #[test]
    fn test_lock_op_timeout_bound() {
        let result = CoordinatorConfig::builder()
            .lock_op_timeout(Duration::from_secs(10))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(CoordinatorConfig::builder().name("  ").build().is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = CoordinatorConfig::builder()
            .collect_window(Duration::ZERO)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            name = "billing"
            renewal_interval_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "billing");
        assert_eq!(config.lock_ttl_ms, DEFAULT_LOCK_TTL_MS);
        assert!(config.validate().is_ok());
    }
}
