//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Engine and pool settings derived from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DEVICE_POOL",
    discovery(
        app_name = "device-pool",
        env_var = "DEVICE_POOL_CONFIG_PATH",
        config_file_name = "device-pool.toml",
        dotfile_name = ".device-pool.toml",
        project_file_name = "device-pool.toml"
    )
)]
pub struct PoolConfig {
    /// Seconds a provision request may hold its hosts before it is reaped.
    /// Defaults to one hour.
    #[ortho_config(default = 3600)]
    pub provision_timeout_secs: u64,
    /// Whether expired requests are reaped in the background.
    #[ortho_config(default = true)]
    pub expire_provisions: bool,
    /// Milliseconds between reaper passes.
    #[ortho_config(default = 1000)]
    pub reap_interval_ms: u64,
    /// Milliseconds between status polls while waiting on a request.
    #[ortho_config(default = 250)]
    pub poll_interval_ms: u64,
    /// Number of new hosts one expansion pass may add.
    #[ortho_config(default = 20)]
    pub expansion_page_size: usize,
    /// Tracing filter directive used when `DEVICE_POOL_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_filter: String,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when merging configuration layers fails.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a value is present but unusable.
    #[error("{0}")]
    Invalid(String),
}

impl PoolConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("device-pool")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads and validates configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load_validated() -> Result<Self, ConfigError> {
        let config = Self::load_without_cli_args()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero durations and sizes and an empty log filter. Messages
    /// name the environment variable that sets the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first unusable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_positive(self.provision_timeout_secs, "provision_timeout_secs")?;
        Self::require_positive(self.reap_interval_ms, "reap_interval_ms")?;
        Self::require_positive(self.poll_interval_ms, "poll_interval_ms")?;
        if self.expansion_page_size == 0 {
            return Err(Self::invalid("expansion_page_size", "must be positive"));
        }
        if self.log_filter.trim().is_empty() {
            return Err(Self::invalid("log_filter", "must not be empty"));
        }
        Ok(())
    }

    fn require_positive(value: u64, field: &str) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(Self::invalid(field, "must be positive"));
        }
        Ok(())
    }

    fn invalid(field: &str, problem: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "{field} {problem}: set DEVICE_POOL_{} or add {field} to device-pool.toml",
            field.to_uppercase()
        ))
    }

    /// Lease length granted to new requests.
    #[must_use]
    pub const fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    /// Period of the expiry sweep.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Delay between status polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for pool configuration validation.

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn base_config() -> PoolConfig {
        PoolConfig {
            provision_timeout_secs: 3600,
            expire_provisions: true,
            reap_interval_ms: 1000,
            poll_interval_ms: 250,
            expansion_page_size: 20,
            log_filter: "info".to_owned(),
        }
    }

    #[rstest]
    fn accepts_defaults(base_config: PoolConfig) {
        assert_eq!(base_config.validate(), Ok(()));
        assert_eq!(base_config.provision_timeout(), Duration::from_secs(3600));
        assert_eq!(base_config.poll_interval(), Duration::from_millis(250));
    }

    #[rstest]
    #[case::timeout(|cfg: &mut PoolConfig| cfg.provision_timeout_secs = 0, "DEVICE_POOL_PROVISION_TIMEOUT_SECS")]
    #[case::reap(|cfg: &mut PoolConfig| cfg.reap_interval_ms = 0, "DEVICE_POOL_REAP_INTERVAL_MS")]
    #[case::poll(|cfg: &mut PoolConfig| cfg.poll_interval_ms = 0, "DEVICE_POOL_POLL_INTERVAL_MS")]
    #[case::page(|cfg: &mut PoolConfig| cfg.expansion_page_size = 0, "DEVICE_POOL_EXPANSION_PAGE_SIZE")]
    #[case::filter(|cfg: &mut PoolConfig| cfg.log_filter = "  ".to_owned(), "DEVICE_POOL_LOG_FILTER")]
    fn rejects_unusable_values(
        mut base_config: PoolConfig,
        #[case] mutate: fn(&mut PoolConfig),
        #[case] env_var: &str,
    ) {
        mutate(&mut base_config);
        let Err(ConfigError::Invalid(message)) = base_config.validate() else {
            panic!("validation should fail for {env_var}");
        };
        assert!(message.contains(env_var), "message was {message}");
    }
}
