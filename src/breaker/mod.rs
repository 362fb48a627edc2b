//! Per-service-group circuit breakers.
//!
//! # States
//! ```text
//! Closed → Open:      failure_count >= failure_threshold
//! Open → HalfOpen:    now - last_failure_time > open_timeout (checked lazily)
//! HalfOpen → Closed:  success_count >= success_threshold
//! HalfOpen → Open:    any failure
//! Closed (idle):      failure_count forgiven after reset_timeout
//! ```
//!
//! There is no background timer: every state query re-evaluates the clock.
//! All counters of one breaker live behind a single mutex so concurrent
//! `execute` calls never trip the breaker from stale state.

use crate::clock::Clock;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

mod config;
mod registry;


pub use config::BreakerConfig;
pub use registry::{BreakerRegistry, BreakerSection};

/// Circuit state of one service group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, calls pass through
    Closed,
    /// Service assumed down, calls fail fast
    Open,
    /// One probe at a time tests recovery
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub group: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

struct Counters {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_reset_time: DateTime<Utc>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one logical service group.
pub struct CircuitBreaker {
    group: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(group: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            group: group.into(),
            config,
            clock,
            counters: Mutex::new(Counters {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_reset_time: now,
                probe_in_flight: false,
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, after applying any time-based transition.
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap();
        self.refresh(&mut counters, now);
        counters.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap();
        self.refresh(&mut counters, now);
        BreakerSnapshot {
            group: self.group.clone(),
            state: counters.state,
            failure_count: counters.failure_count,
            success_count: counters.success_count,
            last_failure_time: counters.last_failure_time,
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Rejects with [`SyncError::BreakerOpen`] without invoking `call` while
    /// open, or while half-open with a probe already in flight.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let permit = self.acquire()?;
        let outcome = call().await;

        match &outcome {
            Ok(_) => permit.succeeded(),
            Err(e) if e.is_service_fault() => permit.failed(),
            // The service answered; it is reachable even if it refused us.
            Err(SyncError::ClientRejected { .. }) => permit.succeeded(),
            Err(_) => drop(permit),
        }

        outcome
    }

    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap();
        self.refresh(&mut counters, now);

        if counters.state == BreakerState::HalfOpen {
            counters.success_count += 1;
            if counters.success_count >= self.config.success_threshold {
                counters.state = BreakerState::Closed;
                counters.failure_count = 0;
                counters.success_count = 0;
                counters.last_reset_time = now;
                info!(group = %self.group, "Circuit breaker closed after successful probes");
            }
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap();
        self.refresh(&mut counters, now);
        counters.last_failure_time = Some(now);

        match counters.state {
            BreakerState::Closed => {
                counters.failure_count += 1;
                if counters.failure_count >= self.config.failure_threshold {
                    counters.state = BreakerState::Open;
                    counters.success_count = 0;
                    warn!(
                        group = %self.group,
                        failures = counters.failure_count,
                        open_timeout_secs = self.config.open_timeout_secs,
                        "Circuit breaker tripped"
                    );
                }
            }
            BreakerState::HalfOpen => {
                counters.state = BreakerState::Open;
                counters.success_count = 0;
                warn!(group = %self.group, "Half-open probe failed, circuit breaker reopened");
            }
            BreakerState::Open => {}
        }
    }

    /// Force the breaker back to closed with zeroed counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap();
        counters.state = BreakerState::Closed;
        counters.failure_count = 0;
        counters.success_count = 0;
        counters.last_failure_time = None;
        counters.last_reset_time = now;
        counters.probe_in_flight = false;
        info!(group = %self.group, "Circuit breaker reset");
    }

    fn acquire(&self) -> Result<Permit<'_>, SyncError> {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap();
        self.refresh(&mut counters, now);

        match counters.state {
            BreakerState::Closed => Ok(Permit {
                breaker: self,
                probe: false,
            }),
            BreakerState::HalfOpen if !counters.probe_in_flight => {
                counters.probe_in_flight = true;
                debug!(group = %self.group, "Letting half-open probe through");
                Ok(Permit {
                    breaker: self,
                    probe: true,
                })
            }
            _ => Err(SyncError::BreakerOpen {
                group: self.group.clone(),
            }),
        }
    }

    /// Apply time-based transitions. Caller holds the counters lock.
    fn refresh(&self, counters: &mut Counters, now: DateTime<Utc>) {
        match counters.state {
            BreakerState::Open => {
                if let Some(last_failure) = counters.last_failure_time {
                    if now - last_failure > self.config.open_timeout() {
                        counters.state = BreakerState::HalfOpen;
                        counters.success_count = 0;
                        counters.probe_in_flight = false;
                        info!(group = %self.group, "Circuit breaker half-open");
                    }
                }
            }
            BreakerState::Closed => {
                if now - counters.last_reset_time > self.config.reset_timeout() {
                    if counters.failure_count > 0 {
                        debug!(
                            group = %self.group,
                            forgiven = counters.failure_count,
                            "Failure window elapsed, resetting count"
                        );
                    }
                    counters.failure_count = 0;
                    counters.last_reset_time = now;
                }
            }
            BreakerState::HalfOpen => {}
        }
    }
}

/// Admission for one call; releases the half-open probe slot on drop.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
}

impl Permit<'_> {
    /// Only the probe speaks for a half-open breaker; a call admitted while
    /// closed may finish after the state moved on.
    fn succeeded(self) {
        if self.probe {
            self.breaker.record_success();
        }
    }

    fn failed(self) {
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.breaker.counters.lock().unwrap().probe_in_flight = false;
        }
    }
}
