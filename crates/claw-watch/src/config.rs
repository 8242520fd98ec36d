//! Process configuration.
//!
//! Loaded from a TOML file where every field has a default, then overridden
//! by command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::DispatcherConfig;
use crate::error::{Result, WatchError};
use crate::pool::PoolConfig;

/// Interpreter pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Number of independent interpreters.
    pub pool_size: usize,
    /// Starlark file run once in every interpreter at startup.
    pub init_script: Option<PathBuf>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            init_script: None,
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    /// Path to the YAML alert file.
    pub alerts: PathBuf,
    /// Search backend address, `host:port` or a URL.
    pub search_addr: String,
    /// Chat webhook URL for `slack` actions.
    pub webhook_endpoint: Option<String>,
    /// Deadline for one alert cycle in seconds.
    pub cycle_timeout_secs: u64,
    /// Timeout for outbound HTTP requests in seconds.
    pub http_timeout_secs: u64,
    /// Interpreter pool settings.
    pub interpreter: InterpreterConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            alerts: PathBuf::from("alerts.yml"),
            search_addr: "127.0.0.1:9200".to_string(),
            webhook_endpoint: None,
            cycle_timeout_secs: 30,
            http_timeout_secs: 10,
            interpreter: InterpreterConfig::default(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WatchError::config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| WatchError::config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` for the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.alerts.as_os_str().is_empty() {
            return Err(WatchError::config("alerts path cannot be empty"));
        }

        if self.search_addr.trim().is_empty() {
            return Err(WatchError::config("search_addr cannot be empty"));
        }

        if self.cycle_timeout_secs == 0 {
            return Err(WatchError::config(
                "cycle_timeout_secs must be greater than 0",
            ));
        }

        if self.http_timeout_secs == 0 {
            return Err(WatchError::config("http_timeout_secs must be greater than 0"));
        }

        if self.interpreter.pool_size == 0 {
            return Err(WatchError::config(
                "interpreter.pool_size must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Returns the cycle deadline.
    #[must_use]
    pub const fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    /// Returns the outbound request timeout.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Builds the pool configuration, reading the init script if one is set.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` if the init script cannot be read.
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig::new(self.interpreter.pool_size);
        let Some(path) = &self.interpreter.init_script else {
            return Ok(config);
        };

        let source = std::fs::read_to_string(path).map_err(|e| {
            WatchError::config(format!(
                "failed to read init script '{}': {e}",
                path.display()
            ))
        })?;
        Ok(config.with_init_script(source))
    }

    /// Builds the dispatcher configuration.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            webhook_endpoint: self.webhook_endpoint.clone(),
            http_timeout: self.http_timeout(),
        }
    }
}
