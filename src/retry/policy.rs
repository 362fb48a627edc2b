use crate::error::SyncError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Policy used for user-triggered actions (freeze, coordinate).
pub const CRITICAL: &str = "critical";
/// Policy used for large payload transfers.
pub const FILE_UPLOAD: &str = "file_upload";
/// Fallback policy for unknown names.
pub const DEFAULT: &str = "default";

/// Serialized form of a retry policy (`[retry.policies.<name>]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Random extra delay as a fraction of the computed delay (0.0 disables)
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_ms() -> u64 {
    15_000
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            jitter: 0.0,
        }
    }
}

/// `[retry]` configuration section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrySection {
    /// Named policies; these override or extend the built-in ones
    #[serde(default)]
    pub policies: HashMap<String, RetryPolicyConfig>,
}

type Predicate = Arc<dyn Fn(&SyncError) -> bool + Send + Sync>;

/// Immutable retry/backoff policy.
#[derive(Clone)]
pub struct RetryPolicy {
    pub name: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    pub jitter: f64,
    retryable: Predicate,
}

impl RetryPolicy {
    pub fn from_config(name: impl Into<String>, config: &RetryPolicyConfig) -> Self {
        Self {
            name: name.into(),
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            retryable: Arc::new(SyncError::is_retryable),
        }
    }

    /// Short delays, three attempts. For operator-triggered actions.
    pub fn critical() -> Self {
        Self::from_config(
            CRITICAL,
            &RetryPolicyConfig {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                attempt_timeout_ms: 10_000,
                ..Default::default()
            },
        )
    }

    /// Fewer attempts with a long per-attempt deadline. For evidence uploads.
    pub fn file_upload() -> Self {
        Self::from_config(
            FILE_UPLOAD,
            &RetryPolicyConfig {
                max_attempts: 2,
                base_delay_ms: 5_000,
                max_delay_ms: 30_000,
                attempt_timeout_ms: 120_000,
                ..Default::default()
            },
        )
    }

    /// Replace the retry classification.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SyncError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &SyncError) -> bool {
        (self.retryable)(error)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = base_ms * self.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let jitter_ms = if self.jitter > 0.0 && capped_ms >= 1.0 {
            rand::thread_rng().gen_range(0.0..capped_ms * self.jitter)
        } else {
            0.0
        };

        Duration::from_millis((capped_ms + jitter_ms) as u64)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// Named retry policies.
#[derive(Clone, Debug)]
pub struct PolicySet {
    policies: HashMap<String, RetryPolicy>,
    fallback: RetryPolicy,
}

impl PolicySet {
    /// Built-in policies overlaid with the configured ones.
    pub fn from_section(section: &RetrySection) -> Self {
        let mut set = Self::default();
        for (name, config) in &section.policies {
            set.insert(RetryPolicy::from_config(name.clone(), config));
        }
        set
    }

    pub fn insert(&mut self, policy: RetryPolicy) {
        if policy.name == DEFAULT {
            self.fallback = policy.clone();
        }
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn get(&self, name: &str) -> Option<&RetryPolicy> {
        self.policies.get(name)
    }

    /// The named policy, falling back to [`DEFAULT`].
    pub fn get_or_default(&self, name: &str) -> &RetryPolicy {
        self.policies.get(name).unwrap_or(&self.fallback)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        let fallback = RetryPolicy::from_config(DEFAULT, &RetryPolicyConfig::default());
        let mut set = Self {
            policies: HashMap::new(),
            fallback: fallback.clone(),
        };
        set.insert(RetryPolicy::critical());
        set.insert(RetryPolicy::file_upload());
        set.insert(fallback);
        set
    }
}
