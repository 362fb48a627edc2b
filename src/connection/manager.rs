use super::protocol::{ControlFrame, Credentials, PushChannel, PushEvent, PushLink};
use super::{ConnectionConfig, ConnectionState};
use crate::error::SyncError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Callback for events on one topic. Runs on the connection task; must not block.
pub type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

const TRANSITION_BUFFER: usize = 64;

struct Registry {
    /// Active topics and their handlers; a topic is removed with its last handler
    topics: HashMap<String, BTreeMap<u64, EventHandler>>,
    /// Frame queue of the live session, if any
    link_tx: Option<mpsc::UnboundedSender<ControlFrame>>,
    next_id: u64,
}

struct Supervisor {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

struct Shared {
    channel: Arc<dyn PushChannel>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    registry: Mutex<Registry>,
    credentials: Mutex<Option<Credentials>>,
}

enum SessionEnd {
    /// Client asked to disconnect
    Stopped,
    /// Server closed cleanly
    Closed,
    Failed(SyncError),
}

/// Owns the single push connection and its topic subscriptions.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    pub fn new(channel: Arc<dyn PushChannel>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);

        Self {
            shared: Arc::new(Shared {
                channel,
                config,
                state_tx,
                transitions,
                registry: Mutex::new(Registry {
                    topics: HashMap::new(),
                    link_tx: None,
                    next_id: 0,
                }),
                credentials: Mutex::new(None),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Every state transition, in order.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.transitions.subscribe()
    }

    /// Latest state only; useful for waiting on a particular state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Start the connection. Replaces the credentials used by later attempts
    /// if a connection is already being maintained.
    pub fn connect(&self, credentials: Credentials) {
        *self.shared.credentials.lock().unwrap() = Some(credentials);
        self.start_supervisor();
    }

    /// Restart after the manager parked in Error or was disconnected.
    ///
    /// Returns false without doing anything while an attempt or session is
    /// active, or if `connect` was never called.
    pub fn reconnect(&self) -> bool {
        if self.shared.credentials.lock().unwrap().is_none() {
            return false;
        }
        self.start_supervisor()
    }

    /// Close the connection and cancel any scheduled reconnect.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().unwrap().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.stop.send(true);
            if let Err(e) = supervisor.handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Connection supervisor panicked");
                }
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Push connection closed by client");
    }

    /// Register `handler` for `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut registry = self.shared.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;

        let first = !registry.topics.contains_key(&topic);
        registry
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(id, Arc::new(handler));

        if first {
            debug!(topic = %topic, "First handler for topic");
            if let Some(tx) = &registry.link_tx {
                let _ = tx.send(ControlFrame::Subscribe {
                    topic: topic.clone(),
                });
            }
        }

        SubscriptionHandle {
            shared: Arc::clone(&self.shared),
            topic,
            id,
        }
    }

    /// Topics with at least one handler, sorted.
    pub fn topics(&self) -> Vec<String> {
        let registry = self.shared.registry.lock().unwrap();
        let mut topics: Vec<String> = registry.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn start_supervisor(&self) -> bool {
        let mut slot = self.supervisor.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            if !existing.handle.is_finished() {
                return false;
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.supervise(stop_rx).await });
        *slot = Some(Supervisor { handle, stop });
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(supervisor) = slot.take() {
                let _ = supervisor.stop.send(true);
                supervisor.handle.abort();
            }
        }
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            let _ = self.transitions.send(state);
        }
    }

    async fn supervise(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            let credentials = self.credentials.lock().unwrap().clone();
            let Some(credentials) = credentials else {
                break;
            };

            self.set_state(ConnectionState::Connecting);
            let connect_timeout = self.config.connect_timeout();
            let opened = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                result = tokio::time::timeout(connect_timeout, self.channel.open(&credentials)) => {
                    result.unwrap_or(Err(SyncError::Timeout(connect_timeout)))
                }
            };

            match opened {
                Ok(link) => {
                    failures = 0;
                    match self.run_session(link, &mut stop).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Closed => {
                            info!("Push connection closed by server");
                            self.set_state(ConnectionState::Disconnected);
                        }
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, "Push connection lost");
                            self.set_state(ConnectionState::Error);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.set_state(ConnectionState::Error);
                    if self.config.max_attempts > 0 && failures >= self.config.max_attempts {
                        error!(
                            attempts = failures,
                            error = %e,
                            "Giving up on push connection until reconnect is requested"
                        );
                        return;
                    }
                    warn!(attempt = failures, error = %e, "Push connection attempt failed");
                }
            }

            let delay = self.config.reconnect_delay(failures);
            self.set_state(ConnectionState::Reconnecting);
            info!(
                delay_ms = delay.as_millis() as u64,
                failures = failures,
                "Scheduling reconnect"
            );

            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(
        &self,
        mut link: Box<dyn PushLink>,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Topics registered after this point reach the link through `tx`,
        // so each topic is subscribed exactly once per session.
        let topics: Vec<String> = {
            let mut registry = self.registry.lock().unwrap();
            registry.link_tx = Some(tx);
            registry.topics.keys().cloned().collect()
        };

        self.set_state(ConnectionState::Connected);
        info!(topics = topics.len(), "Push connection established");

        let end = self.drive(&mut link, topics, &mut rx, stop).await;
        self.registry.lock().unwrap().link_tx = None;
        end
    }

    async fn drive(
        &self,
        link: &mut Box<dyn PushLink>,
        topics: Vec<String>,
        rx: &mut mpsc::UnboundedReceiver<ControlFrame>,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        for topic in topics {
            if let Err(e) = link.send(&ControlFrame::Subscribe { topic }).await {
                return SessionEnd::Failed(e);
            }
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(stop) => {
                    link.close().await;
                    return SessionEnd::Stopped;
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = link.send(&frame).await {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = link.send(&ControlFrame::Ping).await {
                        return SessionEnd::Failed(e);
                    }
                }
                event = link.next_event() => match event {
                    Some(Ok(event)) => self.dispatch(&event),
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Closed,
                },
            }
        }
    }

    fn dispatch(&self, event: &PushEvent) {
        let handlers: Vec<EventHandler> = {
            let registry = self.registry.lock().unwrap();
            registry
                .topics
                .get(&event.topic)
                .map(|handlers| handlers.values().cloned().collect())
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(topic = %event.topic, "Dropping event for topic without handlers");
            return;
        }

        for handler in handlers {
            handler(event);
        }
    }
}

/// Resolves once a stop has been requested (or the manager is gone).
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Registration of one handler. Dropping the handle keeps the handler
/// registered; call [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
    topic: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(self) {
        let mut registry = self.shared.registry.lock().unwrap();
        let Some(handlers) = registry.topics.get_mut(&self.topic) else {
            return;
        };
        handlers.remove(&self.id);

        if handlers.is_empty() {
            registry.topics.remove(&self.topic);
            debug!(topic = %self.topic, "Last handler removed from topic");
            if let Some(tx) = &registry.link_tx {
                let _ = tx.send(ControlFrame::Unsubscribe {
                    topic: self.topic.clone(),
                });
            }
        }
    }
}
