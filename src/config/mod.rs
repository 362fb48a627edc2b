pub mod env;
pub use env::{apply_env_overrides, ENV_API_URL, ENV_CONFIG, ENV_PUSH_URL, ENV_QUEUE_DB, ENV_TOKEN};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// Re-export section types owned by their components
pub use crate::breaker::BreakerSection;
pub use crate::connection::ConnectionConfig;
pub use crate::hotspot::HotspotConfig;
pub use crate::queue::QueueConfig;
pub use crate::retry::RetrySection;

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub breakers: BreakerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub hotspots: HotspotConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Remote endpoints
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the request/response API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// WebSocket endpoint for push updates
    #[serde(default = "default_push_url")]
    pub push_url: String,

    /// Bearer token; normally supplied through the environment
    #[serde(default)]
    pub access_token: Option<String>,

    /// Upper bound on one HTTP exchange, independent of retry attempt timeouts
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_push_url() -> String {
    "ws://localhost:8080/push".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            push_url: default_push_url(),
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("api_url", &self.api_url)
            .field("push_url", &self.push_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<FieldConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: FieldConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
