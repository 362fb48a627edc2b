use crate::error::SyncError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Client → Server control frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}

/// Server → Client: an update published on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl PushEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Credentials presented on every connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Factory for duplex push connections.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open one connection. Returns once the handshake has completed.
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn PushLink>, SyncError>;
}

/// One open duplex connection.
#[async_trait]
pub trait PushLink: Send {
    async fn send(&mut self, frame: &ControlFrame) -> Result<(), SyncError>;

    /// Next inbound event. `None` means the server closed the connection
    /// cleanly. Must be cancel-safe: it is polled inside `select!`.
    async fn next_event(&mut self) -> Option<Result<PushEvent, SyncError>>;

    async fn close(&mut self);
}
