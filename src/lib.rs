// Error taxonomy shared by every component
pub mod error;

// Injectable time source
pub mod clock;

// Cancellation of waits and background loops
pub mod shutdown;

// Remote call abstraction
pub mod service;

// Per-service-group circuit breakers
pub mod breaker;

// Bounded retry with backoff
pub mod retry;

// Breaker + retry wrapper used for every request
pub mod client;

// Persistent push connection with subscription replay
pub mod connection;

// Offline action/evidence queue and background sync
pub mod queue;

// Live hotspot state
pub mod hotspot;

// TOML configuration
pub mod config;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use client::ResilientClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, FieldConfig};
pub use connection::{ConnectionManager, ConnectionState, Credentials, PushChannel, PushEvent, PushLink};
pub use error::SyncError;
pub use hotspot::{Hotspot, HotspotFilter, HotspotManager, HotspotPatch, HotspotSnapshot};
pub use queue::{ItemKind, OfflineQueue, QueuedItem, SubmitOutcome, SyncCoordinator};
pub use retry::{PolicySet, RetryExecutor, RetryPolicy};
pub use service::{ServiceCall, ServiceRequest};
pub use shutdown::{Shutdown, ShutdownSignal};
