use super::OfflineQueue;
use crate::connection::ConnectionState;
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Background task draining the offline queue.
///
/// A drain runs on every timer tick (the first immediately), on every
/// transition to Connected, and whenever `request_sync` is called.
pub struct SyncCoordinator {
    handle: JoinHandle<()>,
}

impl SyncCoordinator {
    pub fn spawn(
        queue: Arc<OfflineQueue>,
        interval: Duration,
        connection_states: Option<broadcast::Receiver<ConnectionState>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let handle = tokio::spawn(run(queue, interval, connection_states, shutdown));
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Wait for the task to finish after shutdown was triggered.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Sync coordinator task failed");
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run(
    queue: Arc<OfflineQueue>,
    interval: Duration,
    mut connection_states: Option<broadcast::Receiver<ConnectionState>>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs_f64(), "Sync coordinator started");

    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = next_connected(&mut connection_states) => "connected",
            _ = queue.sync_requested() => "requested",
            _ = ticker.tick() => "timer",
        };

        debug!(trigger = trigger, "Draining offline queue");
        match queue.drain().await {
            Ok(report) if report.failed > 0 => {
                warn!(
                    trigger = trigger,
                    failed = report.failed,
                    "Items parked as failed during drain"
                );
            }
            Ok(_) => {}
            Err(e) => error!(trigger = trigger, error = %e, "Queue drain failed"),
        }
    }

    info!("Sync coordinator stopped");
}

/// Resolves on the next transition to Connected. Pends forever without a source.
async fn next_connected(states: &mut Option<broadcast::Receiver<ConnectionState>>) {
    let Some(rx) = states.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(ConnectionState::Connected) => return,
            Ok(_) => continue,
            // A Connected transition may be among the skipped ones
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Connection state stream lagged");
                return;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    *states = None;
    std::future::pending().await
}
