use super::{DrainReport, DurableStore, ItemKind, ItemStatus, QueueConfig, QueuedItem, SubmitOutcome};
use crate::client::ResilientClient;
use crate::clock::Clock;
use crate::error::{persistence_failure, SyncError};
use crate::service::ServiceRequest;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};

/// Durable queue of mutations awaiting server confirmation.
pub struct OfflineQueue {
    client: ResilientClient,
    store: Arc<dyn DurableStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    /// Ids with a delivery in progress
    in_flight: Mutex<HashSet<String>>,
    /// One per kind; held from the pending check through the immediate attempt
    submit_gates: [AsyncMutex<()>; 2],
    sync_requested: Notify,
}

/// Holds an item id in the in-flight set for the duration of one delivery.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

impl OfflineQueue {
    pub fn new(
        client: ResilientClient,
        store: Arc<dyn DurableStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            store,
            config,
            clock,
            in_flight: Mutex::new(HashSet::new()),
            submit_gates: [AsyncMutex::new(()), AsyncMutex::new(())],
            sync_requested: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Deliver a mutation now, or persist it for background delivery.
    ///
    /// `ClientRejected` is returned to the caller unqueued. A failure to
    /// persist is returned as `QueuePersistenceFailure`.
    pub async fn submit(
        &self,
        kind: ItemKind,
        request: ServiceRequest,
    ) -> Result<SubmitOutcome, SyncError> {
        // A later submission of the same kind waits here, then sees this one
        // as pending if its attempt failed
        let _turn = self.submit_gate(kind).lock().await;
        let mut item = QueuedItem::new(kind, request, self.clock.now());

        if self.has_pending(kind)? {
            // Keep FIFO order behind items already waiting
            self.persist(&item)?;
            info!(id = %item.id, kind = %kind, operation = %item.operation, "Queued behind pending items");
            self.request_sync();
            return Ok(SubmitOutcome::Queued { id: item.id });
        }

        let outcome = {
            let _guard = self.begin(&item.id);
            self.deliver(&item).await
        };

        match outcome {
            Ok(value) => Ok(SubmitOutcome::Delivered(value)),
            Err(e) if e.is_queueable() => {
                self.apply_failure(&mut item, &e);
                self.persist(&item)?;
                info!(
                    id = %item.id,
                    kind = %kind,
                    operation = %item.operation,
                    error = %e,
                    "Delivery failed, item queued"
                );
                Ok(SubmitOutcome::Queued { id: item.id })
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt every pending item at most once.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        let pending = self
            .store
            .list_by_status(ItemStatus::Pending)
            .map_err(|e| self.storage_error(e))?;

        if pending.is_empty() {
            return Ok(DrainReport::default());
        }

        let per_kind = ItemKind::ALL.iter().map(|kind| {
            let items: Vec<QueuedItem> = pending.iter().filter(|i| i.kind == *kind).cloned().collect();
            self.drain_kind(items)
        });

        let mut report = DrainReport::default();
        for result in join_all(per_kind).await {
            report.merge(result?);
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                "Queue drain finished"
            );
        }
        Ok(report)
    }

    /// Drain immediately, on the caller's task.
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        self.drain().await
    }

    /// Ask the background coordinator for a drain.
    pub fn request_sync(&self) {
        self.sync_requested.notify_one();
    }

    /// Resolves when `request_sync` has been called since the last wait.
    pub async fn sync_requested(&self) {
        self.sync_requested.notified().await;
    }

    pub fn pending_count(&self) -> Result<usize, SyncError> {
        self.store
            .count_by_status(ItemStatus::Pending)
            .map_err(|e| self.storage_error(e))
    }

    pub fn failed_count(&self) -> Result<usize, SyncError> {
        self.store
            .count_by_status(ItemStatus::Failed)
            .map_err(|e| self.storage_error(e))
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedItem>, SyncError> {
        self.store.get(id).map_err(|e| self.storage_error(e))
    }

    /// Items parked after reaching the attempt cap.
    pub fn failed_items(&self) -> Result<Vec<QueuedItem>, SyncError> {
        self.store
            .list_by_status(ItemStatus::Failed)
            .map_err(|e| self.storage_error(e))
    }

    pub fn mark_synced(&self, id: &str) -> Result<(), SyncError> {
        let mut item = self.require(id)?;
        item.status = ItemStatus::Synced;
        item.last_error = None;
        item.updated_at = self.clock.now();
        self.persist(&item)?;
        debug!(id = %id, "Queued item synced");
        Ok(())
    }

    /// Record a failed delivery attempt. Returns the item's resulting status.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<ItemStatus, SyncError> {
        let mut item = self.require(id)?;
        item.attempt_count = item.attempt_count.saturating_add(1);
        item.last_error = Some(reason.to_string());
        item.updated_at = self.clock.now();
        if item.attempt_count >= self.config.max_attempts {
            self.park(&mut item);
        }
        self.persist(&item)?;
        Ok(item.status)
    }

    /// Operator accepted a failed item; it is removed.
    pub fn acknowledge(&self, id: &str) -> Result<(), SyncError> {
        let item = self.require_failed(id)?;
        self.store
            .delete(&item.id)
            .map_err(|e| self.storage_error(e))?;
        info!(id = %id, operation = %item.operation, "Failed item acknowledged");
        Ok(())
    }

    /// Give a failed item a fresh set of attempts.
    pub fn requeue(&self, id: &str) -> Result<(), SyncError> {
        let mut item = self.require_failed(id)?;
        item.status = ItemStatus::Pending;
        item.attempt_count = 0;
        item.updated_at = self.clock.now();
        self.persist(&item)?;
        info!(id = %id, operation = %item.operation, "Failed item requeued");
        self.request_sync();
        Ok(())
    }

    /// Delete archived synced items. Returns how many were removed.
    pub fn purge_synced(&self) -> Result<usize, SyncError> {
        let synced = self
            .store
            .list_by_status(ItemStatus::Synced)
            .map_err(|e| self.storage_error(e))?;

        let mut removed = 0;
        for item in synced {
            if self
                .store
                .delete(&item.id)
                .map_err(|e| self.storage_error(e))?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed = removed, "Purged synced items");
        }
        Ok(removed)
    }

    async fn drain_kind(&self, items: Vec<QueuedItem>) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        let mut remaining = items.into_iter();

        while let Some(listed) = remaining.next() {
            let Some(_guard) = self.begin(&listed.id) else {
                // Another drain owns this item; order within the kind must hold
                debug!(id = %listed.id, "Item already in flight, deferring kind");
                report.deferred += 1 + remaining.len();
                break;
            };

            // The listing may be stale by now
            let mut item = match self.get(&listed.id)? {
                Some(item) if item.status == ItemStatus::Pending => item,
                _ => continue,
            };

            report.attempted += 1;
            match self.deliver(&item).await {
                Ok(_) => {
                    item.status = ItemStatus::Synced;
                    item.last_error = None;
                    item.updated_at = self.clock.now();
                    self.persist(&item)?;
                    report.synced += 1;
                }
                Err(e @ SyncError::ClientRejected { .. }) => {
                    // The server will never accept it; later items are unaffected
                    item.last_error = Some(e.to_string());
                    item.attempt_count = item.attempt_count.saturating_add(1);
                    item.updated_at = self.clock.now();
                    self.park(&mut item);
                    self.persist(&item)?;
                    report.failed += 1;
                }
                Err(e) => {
                    self.apply_failure(&mut item, &e);
                    self.persist(&item)?;
                    if item.status == ItemStatus::Failed {
                        report.failed += 1;
                    } else {
                        report.deferred += 1;
                    }
                    report.deferred += remaining.len();
                    debug!(
                        id = %item.id,
                        kind = %item.kind,
                        error = %e,
                        "Delivery failed, deferring rest of kind"
                    );
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn deliver(&self, item: &QueuedItem) -> Result<serde_json::Value, SyncError> {
        self.client
            .call(
                item.kind.service_group(),
                item.kind.policy_name(),
                &item.to_request(),
            )
            .await
    }

    /// Count a failed attempt on `item`, parking it at the cap.
    /// Calls refused by an open breaker or cut short by shutdown never reached
    /// the server and are not counted.
    fn apply_failure(&self, item: &mut QueuedItem, error: &SyncError) {
        if !matches!(error, SyncError::BreakerOpen { .. } | SyncError::Cancelled) {
            item.attempt_count = item.attempt_count.saturating_add(1);
        }
        item.last_error = Some(error.to_string());
        item.updated_at = self.clock.now();
        if item.attempt_count >= self.config.max_attempts {
            self.park(item);
        }
    }

    fn park(&self, item: &mut QueuedItem) {
        item.status = ItemStatus::Failed;
        warn!(
            id = %item.id,
            kind = %item.kind,
            operation = %item.operation,
            attempts = item.attempt_count,
            last_error = item.last_error.as_deref().unwrap_or(""),
            "Item parked as failed, needs operator acknowledgment"
        );
    }

    fn begin(&self, id: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap();
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    fn submit_gate(&self, kind: ItemKind) -> &AsyncMutex<()> {
        match kind {
            ItemKind::Action => &self.submit_gates[0],
            ItemKind::Evidence => &self.submit_gates[1],
        }
    }

    fn has_pending(&self, kind: ItemKind) -> Result<bool, SyncError> {
        let pending = self
            .store
            .list_by_status(ItemStatus::Pending)
            .map_err(|e| self.storage_error(e))?;
        Ok(pending.iter().any(|i| i.kind == kind))
    }

    fn require(&self, id: &str) -> Result<QueuedItem, SyncError> {
        self.get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("queued item {}", id)))
    }

    fn require_failed(&self, id: &str) -> Result<QueuedItem, SyncError> {
        match self.get(id)? {
            Some(item) if item.status == ItemStatus::Failed => Ok(item),
            _ => Err(SyncError::NotFound(format!("failed item {}", id))),
        }
    }

    fn persist(&self, item: &QueuedItem) -> Result<(), SyncError> {
        self.store.put(item).map_err(|e| self.storage_error(e))
    }

    fn storage_error(&self, err: anyhow::Error) -> SyncError {
        error!(error = %format!("{:#}", err), "Offline queue storage failure");
        persistence_failure(err)
    }
}
