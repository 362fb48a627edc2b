use crate::error::SyncError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named remote operation with an opaque JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Remote operation name (e.g. "freeze_account", "upload_evidence")
    pub operation: String,

    /// Operation payload (opaque to the sync layer)
    pub payload: Value,

    /// Client-generated key the server deduplicates retries on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ServiceRequest {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Invocation of a remote service.
///
/// Implementations own the transport; they must classify every failure into
/// a [`SyncError`] variant (`NetworkUnavailable`, `Timeout`, `ServerError`,
/// `ClientRejected`) so the retry and breaker layers can act on it.
#[async_trait]
pub trait ServiceCall: Send + Sync {
    async fn invoke(&self, request: &ServiceRequest) -> Result<Value, SyncError>;
}
