use std::time::Duration;
use thiserror::Error;

/// Classified failure of any network-bound or queue operation.
///
/// Every remote call made through the sync layer ends in one of these
/// variants; retry, breaker and queue decisions are taken on the variant
/// alone, never on message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// No route to the server (DNS, refused connection, radio off).
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The attempt did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 5xx-class answer, or 429 throttling.
    #[error("server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    /// 4xx-class answer. Retrying cannot change the outcome.
    #[error("request rejected (status {status}): {message}")]
    ClientRejected { status: u16, message: String },

    /// The circuit breaker for `group` refused the call without attempting it.
    #[error("circuit breaker '{group}' is open")]
    BreakerOpen { group: String },

    /// Every attempt allowed by the retry policy failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<SyncError> },

    /// The durable queue could not record an item; its delivery is no longer guaranteed.
    #[error("queue persistence failed: {0}")]
    QueuePersistenceFailure(String),

    /// Shutdown was requested while the operation was pending.
    #[error("operation cancelled")]
    Cancelled,

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Classify an HTTP-style status code.
    ///
    /// 429 is grouped with server errors: throttling is transient and worth
    /// retrying, unlike the rest of the 4xx range.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 | 500..=599 => SyncError::ServerError { status, message },
            _ => SyncError::ClientRejected { status, message },
        }
    }

    /// Default retry classification: transient transport and server faults.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_) | SyncError::Timeout(_) | SyncError::ServerError { .. }
        )
    }

    /// Whether the error says something about the health of the remote service.
    pub fn is_service_fault(&self) -> bool {
        self.is_retryable()
    }

    /// Whether a failed user mutation should be parked in the offline queue.
    pub fn is_queueable(&self) -> bool {
        match self {
            SyncError::NetworkUnavailable(_)
            | SyncError::Timeout(_)
            | SyncError::ServerError { .. }
            | SyncError::BreakerOpen { .. }
            | SyncError::RetryExhausted { .. }
            | SyncError::Cancelled => true,
            SyncError::ClientRejected { .. }
            | SyncError::QueuePersistenceFailure(_)
            | SyncError::NotFound(_) => false,
        }
    }
}

/// Convert storage errors at the queue boundary.
pub(crate) fn persistence_failure(err: anyhow::Error) -> SyncError {
    SyncError::QueuePersistenceFailure(format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            SyncError::from_status(503, "unavailable"),
            SyncError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            SyncError::from_status(429, "slow down"),
            SyncError::ServerError { status: 429, .. }
        ));
        assert!(matches!(
            SyncError::from_status(422, "bad case id"),
            SyncError::ClientRejected { status: 422, .. }
        ));
        assert!(matches!(
            SyncError::from_status(401, "expired token"),
            SyncError::ClientRejected { status: 401, .. }
        ));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(SyncError::NetworkUnavailable("offline".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(SyncError::from_status(500, "").is_retryable());
        assert!(!SyncError::from_status(400, "").is_retryable());
        assert!(!SyncError::BreakerOpen { group: "alerts".into() }.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_queueable_classes() {
        assert!(SyncError::BreakerOpen { group: "actions".into() }.is_queueable());
        assert!(SyncError::RetryExhausted {
            attempts: 3,
            last: Box::new(SyncError::Timeout(Duration::from_secs(1))),
        }
        .is_queueable());
        assert!(!SyncError::from_status(403, "forbidden").is_queueable());
        assert!(!SyncError::QueuePersistenceFailure("disk full".into()).is_queueable());
    }
}
