use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Cache resync scheduling
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncConfig {
    /// Delay after entering `Active` before the one-shot full resync
    /// that absorbs events missed between initial sync and watch setup.
    /// Default: 5000 ms; `0` disables the resync.
    #[serde(default = "default_resync_delay_ms")]
    pub resync_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_delay_ms: default_resync_delay_ms(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    pub fn resync_delay(&self) -> Option<Duration> {
        (self.resync_delay_ms > 0).then(|| Duration::from_millis(self.resync_delay_ms))
    }
}

fn default_resync_delay_ms() -> u64 {
    5000
}
