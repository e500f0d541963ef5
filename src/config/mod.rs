//! Configuration management for the service registry.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Optional `config/registry.toml` next to the working directory
//! - Configuration file given by `REGISTRY_CONFIG`
//! - Environment variable overrides (`REGISTRY__STORE__LEASE_TTL_SECS=30`)
//! - Component-wise validation
mod monitoring;
mod retry;
mod store;
mod sync;
pub use monitoring::*;
pub use retry::*;
pub use store::*;
pub use sync::*;

#[cfg(test)]
mod config_test;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::RegisterParams;
use crate::Result;

const ENV_PREFIX: &str = "REGISTRY";
const ENV_CONFIG_PATH: &str = "REGISTRY_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "config/registry";

/// Main configuration container for the registry components
///
/// Later sources override earlier ones:
/// 1. Default values from code implementation
/// 2. `config/registry.toml` (optional)
/// 3. Configuration file specified by `REGISTRY_CONFIG`
/// 4. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RegistryConfig {
    /// Store connection and lease parameters
    #[serde(default)]
    pub store: StoreConfig,
    /// Self-healing loop policies (lease rebootstrap, watch reopen)
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Cache resync scheduling
    #[serde(default)]
    pub sync: SyncConfig,
    /// Metrics exporter settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Registration parameters used by the binary
    #[serde(default)]
    pub registration: RegisterParams,
}

impl RegistryConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// # Note
    /// Validation is deferred so callers can still apply
    /// [`with_override_config`](Self::with_override_config). Call
    /// [`validate`](Self::validate) before use.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));

        if let Ok(config_path) = env::var(ENV_CONFIG_PATH) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies overrides from an explicit file; environment variables
    /// still win.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path).required(true))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Convenience: [`new`](Self::new), optional override file, then
    /// [`validate`](Self::validate).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = Self::new()?;
        let config = match path {
            Some(p) => config.with_override_config(p)?,
            None => config,
        };
        config.validate()
    }

    /// Validates all subsystems and returns the validated instance.
    ///
    /// Registration parameters are not checked here; they are validated
    /// by [`ServiceRegistry::register`](crate::ServiceRegistry::register)
    /// so library users can pass them separately.
    pub fn validate(self) -> Result<Self> {
        self.store.validate()?;
        self.retry.validate()?;
        self.sync.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
