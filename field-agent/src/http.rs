use anyhow::{Context, Result};
use async_trait::async_trait;
use fieldlink::{ServiceCall, ServiceRequest, SyncError};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Characters of server message carried into an error
const MAX_ERROR_BODY: usize = 512;

/// [`ServiceCall`] over the JSON request/response API.
///
/// `POST {base_url}/api/{operation}` with the payload as body, the access
/// token as bearer auth and the idempotency key in an `Idempotency-Key`
/// header.
pub struct HttpServiceCall {
    http_client: Client,
    base_url: String,
    access_token: Option<String>,
    timeout: Duration,
}

impl HttpServiceCall {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent("fieldlink-agent/0.1")
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            timeout,
        })
    }

    fn url_for(&self, operation: &str) -> String {
        format!("{}/api/{}", self.base_url, urlencoding::encode(operation))
    }

    fn classify(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else if let Some(status) = e.status() {
            SyncError::from_status(status.as_u16(), e.to_string())
        } else {
            SyncError::NetworkUnavailable(e.to_string())
        }
    }
}

#[async_trait]
impl ServiceCall for HttpServiceCall {
    async fn invoke(&self, request: &ServiceRequest) -> Result<Value, SyncError> {
        let url = self.url_for(&request.operation);
        debug!(url = %url, operation = %request.operation, "POST");

        let mut builder = self.http_client.post(&url).json(&request.payload);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(SyncError::from_status(status.as_u16(), message));
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&bytes).map_err(|e| SyncError::ServerError {
            status: status.as_u16(),
            message: format!("invalid response body: {}", e),
        })
    }
}
