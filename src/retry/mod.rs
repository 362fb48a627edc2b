//! Bounded retry with exponential backoff.
//!
//! # Data Flow
//! ```text
//! run(policy, call)
//!     → attempt n under policy.attempt_timeout
//!     → Ok                          → return value
//!     → Err, not retryable          → return the error unchanged
//!     → Err, retryable, n == max    → RetryExhausted
//!     → Err, retryable, n < max     → sleep delay_for(n), attempt n + 1
//! ```
//!
//! `run_guarded` puts a circuit breaker inside every attempt, so an open
//! breaker ends the loop on the spot (`BreakerOpen` is not retryable) instead
//! of sleeping through the remaining backoff.

use crate::breaker::CircuitBreaker;
use crate::error::SyncError;
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

mod policy;

#[cfg(test)]
mod tests;

pub use policy::{PolicySet, RetryPolicy, RetryPolicyConfig, RetrySection, CRITICAL, DEFAULT, FILE_UPLOAD};

/// Executes calls under a [`RetryPolicy`].
///
/// Backoff sleeps and in-flight attempts are abandoned with
/// [`SyncError::Cancelled`] once the shutdown signal fires.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    shutdown: ShutdownSignal,
}

impl RetryExecutor {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { shutdown }
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// policy's attempts are used up. `call` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, policy: &RetryPolicy, call: F) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.run_attempts(policy, call, true).await
    }

    /// Like [`run`](Self::run), with every attempt gated by `breaker`.
    ///
    /// The attempt deadline is applied inside the breaker so timeouts count
    /// against the service's health.
    pub async fn run_guarded<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        breaker: &CircuitBreaker,
        mut call: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let attempt_timeout = policy.attempt_timeout;
        self.run_attempts(
            policy,
            |attempt| {
                let fut = call(attempt);
                breaker.execute(move || with_deadline(attempt_timeout, fut))
            },
            false,
        )
        .await
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut call: F,
        apply_timeout: bool,
    ) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let fut = call(attempt);
            let outcome = tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(SyncError::Cancelled),
                outcome = async {
                    if apply_timeout {
                        with_deadline(policy.attempt_timeout, fut).await
                    } else {
                        fut.await
                    }
                } => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !policy.is_retryable(&error) {
                debug!(
                    policy = %policy.name,
                    attempt = attempt,
                    error = %error,
                    "Non-retryable failure"
                );
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(
                    policy = %policy.name,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(SyncError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = policy.delay_for(attempt);
            debug!(
                policy = %policy.name,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off before retry"
            );

            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T, SyncError>
where
    Fut: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(outcome) => outcome,
        Err(_) => Err(SyncError::Timeout(deadline)),
    }
}
