use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Policies of the background self-healing loops
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct RetryPolicies {
    /// Fixed backoff between lease re-acquisition attempts after the
    /// keepalive stream closed (unit: milliseconds)
    #[serde(default = "default_lease_rebootstrap_interval_ms")]
    pub lease_rebootstrap_interval_ms: u64,

    /// Wait before re-opening a closed watch stream (unit: milliseconds)
    #[serde(default = "default_watch_reopen_interval_ms")]
    pub watch_reopen_interval_ms: u64,

    /// Consecutive failed re-opens tolerated before the whole
    /// connection is re-established
    #[serde(default = "default_watch_max_failed_attempts")]
    pub watch_max_failed_attempts: u32,

    /// Pause after a transient watch response error (unit: milliseconds)
    #[serde(default = "default_watch_error_pause_ms")]
    pub watch_error_pause_ms: u64,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            lease_rebootstrap_interval_ms: default_lease_rebootstrap_interval_ms(),
            watch_reopen_interval_ms: default_watch_reopen_interval_ms(),
            watch_max_failed_attempts: default_watch_max_failed_attempts(),
            watch_error_pause_ms: default_watch_error_pause_ms(),
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        if self.lease_rebootstrap_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "retry.lease_rebootstrap_interval_ms must be > 0".into(),
            ));
        }
        if self.watch_reopen_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "retry.watch_reopen_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_rebootstrap_interval(&self) -> Duration {
        Duration::from_millis(self.lease_rebootstrap_interval_ms)
    }

    pub fn watch_reopen_interval(&self) -> Duration {
        Duration::from_millis(self.watch_reopen_interval_ms)
    }

    pub fn watch_error_pause(&self) -> Duration {
        Duration::from_millis(self.watch_error_pause_ms)
    }
}

fn default_lease_rebootstrap_interval_ms() -> u64 {
    5000
}
fn default_watch_reopen_interval_ms() -> u64 {
    1000
}
fn default_watch_max_failed_attempts() -> u32 {
    10
}
fn default_watch_error_pause_ms() -> u64 {
    100
}
