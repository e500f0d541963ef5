use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Consistent store connection and lease parameters
///
/// ```toml
/// [store]
/// dial_timeout_ms = 5000
/// lease_ttl_secs = 60
/// revoke_timeout_ms = 5000
/// shutdown_delay_ms = 300
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Maximum time to wait for the initial connection
    /// Default: 5 seconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// TTL of the registration lease; keys bound to it vanish this long
    /// after the process stops renewing
    /// Default: 60 seconds
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Upper bound for the lease revoke issued on shutdown
    /// Default: 5 seconds
    #[serde(default = "default_revoke_timeout_ms")]
    pub revoke_timeout_ms: u64,

    /// Pause after revoke so peers observe the deletes before the
    /// connection closes
    /// Default: 300 ms
    #[serde(default = "default_shutdown_delay_ms")]
    pub shutdown_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            revoke_timeout_ms: default_revoke_timeout_ms(),
            shutdown_delay_ms: default_shutdown_delay_ms(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dial_timeout_ms == 0 {
            return Err(Error::InvalidConfig("store.dial_timeout_ms must be > 0".into()));
        }
        if self.lease_ttl_secs == 0 {
            return Err(Error::InvalidConfig("store.lease_ttl_secs must be > 0".into()));
        }
        if self.revoke_timeout_ms == 0 {
            return Err(Error::InvalidConfig("store.revoke_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn revoke_timeout(&self) -> Duration {
        Duration::from_millis(self.revoke_timeout_ms)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }
}

fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_lease_ttl_secs() -> u64 {
    60
}
fn default_revoke_timeout_ms() -> u64 {
    5000
}
fn default_shutdown_delay_ms() -> u64 {
    300
}
