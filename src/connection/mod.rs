//! Persistent duplex push connection.
//!
//! # Lifecycle
//! ```text
//! connect(credentials)
//!     → Connecting → open() under connect_timeout
//!         → ok:   Connected, replay every active topic once, heartbeat
//!         → err:  Error → Reconnecting (tier delay) → Connecting
//! server close      → Disconnected → Reconnecting → Connecting
//! max_attempts hit  → Error (parked until reconnect())
//! disconnect()      → Disconnected (no reconnect)
//! ```
//!
//! Topic subscriptions are reference counted; the server only sees a
//! subscribe frame when a topic gains its first handler and an unsubscribe
//! frame when it loses its last.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

mod manager;
mod protocol;

#[cfg(test)]
mod tests;

pub use manager::{ConnectionManager, EventHandler, SubscriptionHandle};
pub use protocol::{ControlFrame, Credentials, PushChannel, PushEvent, PushLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// `[connection]` configuration section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Reconnect delay tiers, indexed by consecutive failures
    #[serde(default = "default_reconnect_delays_ms")]
    pub reconnect_delays_ms: Vec<u64>,

    /// Consecutive failed attempts before parking in Error
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_reconnect_delays_ms() -> Vec<u64> {
    vec![3_000, 6_000, 12_000, 24_000, 30_000]
}

fn default_max_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delays_ms: default_reconnect_delays_ms(),
            max_attempts: default_max_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    /// Delay before the next attempt after `failures` consecutive failures.
    /// Zero failures (a session that ended after connecting) uses the first tier.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let tier = failures.saturating_sub(1) as usize;
        let ms = self
            .reconnect_delays_ms
            .get(tier)
            .or_else(|| self.reconnect_delays_ms.last())
            .copied()
            .unwrap_or(30_000);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
