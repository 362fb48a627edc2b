use crate::http::HttpServiceCall;
use crate::ws::WsPushChannel;
use anyhow::{Context, Result};
use fieldlink::connection::SubscriptionHandle;
use fieldlink::hotspot::HOTSPOT_TOPIC;
use fieldlink::queue::{DurableStore, SqliteQueueStore};
use fieldlink::{
    BreakerRegistry, BreakerSnapshot, Clock, ConnectionManager, ConnectionState, Credentials,
    FieldConfig, HotspotManager, OfflineQueue, PolicySet, PushChannel, ResilientClient,
    RetryExecutor, ServiceCall, Shutdown, SyncCoordinator, SyncError, SystemClock,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Point-in-time view of every component, for status displays and logs.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub connection: ConnectionState,
    pub pending_items: usize,
    pub failed_items: usize,
    pub breakers: Vec<BreakerSnapshot>,
    pub hotspots: usize,
    pub topics: Vec<String>,
}

/// Owns the sync layer: one breaker registry, one push connection, one
/// offline queue and one hotspot view, plus their background tasks.
pub struct FieldAgent {
    config: FieldConfig,
    client: ResilientClient,
    connection: Arc<ConnectionManager>,
    queue: Arc<OfflineQueue>,
    hotspots: Arc<HotspotManager>,
    shutdown: Shutdown,
    tasks: Mutex<Option<Tasks>>,
}

struct Tasks {
    coordinator: SyncCoordinator,
    prune: JoinHandle<()>,
    hotspot_feed: SubscriptionHandle,
}

impl FieldAgent {
    /// Build the agent with HTTP, WebSocket and SQLite backends from `config`.
    ///
    /// Must be called inside a Tokio runtime; background tasks start immediately.
    pub fn from_config(config: FieldConfig) -> Result<Self> {
        let service = HttpServiceCall::new(
            config.service.api_url.clone(),
            config.service.access_token.clone(),
            config.service.request_timeout(),
        )?;
        let channel = WsPushChannel::new(config.service.push_url.clone());
        let store = SqliteQueueStore::new(&config.queue.db_path)
            .context("Failed to initialize offline queue store")?;

        Ok(Self::with_parts(
            config,
            Arc::new(service),
            Arc::new(channel),
            Arc::new(store),
            Arc::new(SystemClock),
        ))
    }

    /// Build the agent over caller-supplied transports, store and clock.
    pub fn with_parts(
        config: FieldConfig,
        service: Arc<dyn ServiceCall>,
        channel: Arc<dyn PushChannel>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shutdown = Shutdown::new();

        let breakers = Arc::new(BreakerRegistry::new(config.breakers.clone(), Arc::clone(&clock)));
        let policies = Arc::new(PolicySet::from_section(&config.retry));
        let client = ResilientClient::new(
            service,
            breakers,
            policies,
            RetryExecutor::new(shutdown.signal()),
        );

        let connection = Arc::new(ConnectionManager::new(channel, config.connection.clone()));
        let queue = Arc::new(OfflineQueue::new(
            client.clone(),
            store,
            config.queue.clone(),
            Arc::clone(&clock),
        ));
        let hotspots = Arc::new(HotspotManager::new(config.hotspots.clone(), clock));

        let sink = Arc::clone(&hotspots);
        let hotspot_feed = connection.subscribe(HOTSPOT_TOPIC, move |event| sink.handle_push(event));

        let coordinator = SyncCoordinator::spawn(
            Arc::clone(&queue),
            config.queue.sync_interval(),
            Some(connection.subscribe_state()),
            shutdown.signal(),
        );
        let prune = tokio::spawn(Arc::clone(&hotspots).run_prune_loop(shutdown.signal()));

        info!(
            api_url = %config.service.api_url,
            push_url = %config.service.push_url,
            "Field agent started"
        );

        Self {
            config,
            client,
            connection,
            queue,
            hotspots,
            shutdown,
            tasks: Mutex::new(Some(Tasks {
                coordinator,
                prune,
                hotspot_feed,
            })),
        }
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn hotspots(&self) -> &Arc<HotspotManager> {
        &self.hotspots
    }

    /// Open the push connection; reconnects are handled by the manager.
    pub fn connect(&self, credentials: Credentials) {
        self.connection.connect(credentials);
    }

    pub fn status(&self) -> Result<AgentStatus, SyncError> {
        Ok(AgentStatus {
            connection: self.connection.state(),
            pending_items: self.queue.pending_count()?,
            failed_items: self.queue.failed_count()?,
            breakers: self.client.breakers().snapshot_all(),
            hotspots: self.hotspots.len(),
            topics: self.connection.topics(),
        })
    }

    /// Stop background work, cancel in-flight retries and close the connection.
    ///
    /// Queued items stay in the store for the next start. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();

        let tasks = self.tasks.lock().unwrap().take();
        if let Some(tasks) = tasks {
            tasks.hotspot_feed.unsubscribe();
            tasks.coordinator.join().await;
            if let Err(e) = tasks.prune.await {
                error!(error = %e, "Hotspot prune task failed");
            }
        }

        self.connection.disconnect().await;
        info!("Field agent stopped");
    }
}

impl Drop for FieldAgent {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
