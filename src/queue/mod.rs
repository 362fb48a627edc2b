//! Offline queue for user mutations.
//!
//! # Data Flow
//! ```text
//! submit(kind, request)
//!     → pending items of same kind?  → persist behind them, request drain
//!     → immediate delivery via ResilientClient
//!         → Ok                       → Delivered
//!         → ClientRejected           → returned, never queued
//!         → transient/breaker/cancel → persist as pending → Queued
//!
//! drain()   (SyncCoordinator: timer, Connected transition, request_sync)
//!     → pending items grouped by kind, kinds in parallel
//!     → FIFO per kind; first failure defers the rest of the kind
//!     → attempt cap reached          → failed (operator acknowledgment)
//! ```

use crate::service::ServiceRequest;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

mod coordinator;
mod offline;
mod store;


pub use coordinator::SyncCoordinator;
pub use offline::OfflineQueue;
pub use store::{DurableStore, MemoryQueueStore, SqliteQueueStore};

/// Kind of queued mutation; decides service group and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Enforcement action (freeze account, coordinate units)
    Action,
    /// Evidence upload
    Evidence,
}

impl ItemKind {
    pub const ALL: [ItemKind; 2] = [ItemKind::Action, ItemKind::Evidence];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Action => "action",
            ItemKind::Evidence => "evidence",
        }
    }

    /// Breaker group the kind's deliveries go through.
    pub fn service_group(&self) -> &'static str {
        match self {
            ItemKind::Action => "actions",
            ItemKind::Evidence => "evidence",
        }
    }

    /// Retry policy the kind's deliveries use.
    pub fn policy_name(&self) -> &'static str {
        match self {
            ItemKind::Action => crate::retry::CRITICAL,
            ItemKind::Evidence => crate::retry::FILE_UPLOAD,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "action" => Ok(ItemKind::Action),
            "evidence" => Ok(ItemKind::Evidence),
            other => Err(anyhow!("Unknown item kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Synced,
    /// Attempt cap reached; waits for operator acknowledgment
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Synced => "synced",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "synced" => Ok(ItemStatus::Synced),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(anyhow!("Unknown item status: {}", other)),
        }
    }
}

/// A mutation that could not be confirmed immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// UUIDv7, also the idempotency key of every delivery attempt
    pub id: String,
    pub kind: ItemKind,
    pub operation: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Delivery attempts so far, including the initial one
    pub attempt_count: u32,
    pub status: ItemStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedItem {
    pub fn new(kind: ItemKind, request: ServiceRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            operation: request.operation,
            payload: request.payload,
            created_at: now,
            attempt_count: 0,
            status: ItemStatus::Pending,
            last_error: None,
            updated_at: now,
        }
    }

    /// The request sent on every delivery attempt of this item.
    pub fn to_request(&self) -> ServiceRequest {
        ServiceRequest::new(self.operation.clone(), self.payload.clone())
            .with_idempotency_key(self.id.clone())
    }
}

/// `[queue]` configuration section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lifetime delivery attempts before an item is parked as failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_db_path() -> String {
    "fieldlink-queue.db".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            sync_interval_secs: default_sync_interval_secs(),
            db_path: default_db_path(),
        }
    }
}

impl QueueConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The server confirmed the mutation
    Delivered(Value),
    /// Persisted; the coordinator will deliver it later
    Queued { id: String },
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    /// Items that reached the attempt cap (or were rejected) during this pass
    pub failed: usize,
    /// Items left for a later pass
    pub deferred: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.synced += other.synced;
        self.failed += other.failed;
        self.deferred += other.deferred;
    }
}
