//! Manager configuration
//!
//! A JSON document naming the breakers a manager should own:
//!
//! ```json
//! {
//!   "health_check_interval_ms": 30000,
//!   "breakers": {
//!     "payments": { "preset": "external_api", "failure_threshold": 4 },
//!     "catalog-db": { "preset": "database" }
//!   }
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::resilience::{
    BreakerSettings, CircuitBreaker, CircuitBreakerFactory, CircuitBreakerManager, Preset,
};

/// Configuration of one named breaker
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Preset the settings are merged over
    #[serde(default)]
    pub preset: Preset,
    /// Overrides
    #[serde(flatten)]
    pub settings: BreakerSettings,
}

/// Manager configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Cadence of the health sweep in milliseconds
    pub health_check_interval_ms: u64,
    /// Breakers to create, by name
    pub breakers: BTreeMap<String, BreakerConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30000,
            breakers: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate a configuration document
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).context("Failed to parse manager config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval_ms == 0 {
            bail!("health_check_interval_ms must be greater than zero");
        }

        for (name, breaker) in &self.breakers {
            if name.trim().is_empty() {
                bail!("breaker names must not be empty");
            }

            let settings = &breaker.settings;
            if settings.failure_threshold == Some(0) {
                bail!("breaker {}: failure_threshold must be greater than zero", name);
            }
            if settings.timeout_ms == Some(0) {
                bail!("breaker {}: timeout_ms must be greater than zero", name);
            }
            if settings.monitor_interval_ms == Some(0) {
                bail!("breaker {}: monitor_interval_ms must be greater than zero", name);
            }
            if settings.half_open_max_trials == Some(0) {
                bail!("breaker {}: half_open_max_trials must be greater than zero", name);
            }
        }

        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Create the configured breaker called `name`
    pub fn create_breaker(&self, name: &str) -> Option<CircuitBreaker<serde_json::Value>> {
        let breaker = self.breakers.get(name)?;
        Some(CircuitBreakerFactory::create(
            breaker.preset,
            name,
            breaker.settings.clone().into(),
        ))
    }

    /// Create a manager with every configured breaker registered
    pub async fn build(&self) -> Result<CircuitBreakerManager> {
        CircuitBreakerManager::with_config(self).await
    }
}

impl CircuitBreakerManager {
    /// Create a manager from a validated configuration
    pub async fn with_config(config: &ManagerConfig) -> Result<Self> {
        config.validate()?;

        let manager = Self::with_health_check_interval(config.health_check_interval());
        for name in config.breakers.keys() {
            if let Some(breaker) = config.create_breaker(name) {
                manager.register(name.clone(), breaker).await;
            }
        }

        info!(
            "Circuit breaker manager configured with {} breakers",
            config.breakers.len()
        );
        Ok(manager)
    }
}
