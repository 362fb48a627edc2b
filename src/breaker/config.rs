use serde::{Deserialize, Serialize};

/// Thresholds and windows for one circuit breaker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures (within the reset window) that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Half-open successes needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Seconds after the last failure before an open breaker lets a probe through
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// Seconds of a closed breaker after which the failure count is forgiven
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_reset_timeout_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    pub(crate) fn open_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.open_timeout_secs as i64)
    }

    pub(crate) fn reset_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reset_timeout_secs as i64)
    }
}
