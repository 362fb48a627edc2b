use super::*;
use crate::error::SyncError;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

enum ServerCmd {
    Event(PushEvent),
    Close,
    Fail,
}

/// In-memory push server. Every successful `open` starts a new session whose
/// inbound side is driven through `server_push`/`server_close`.
#[derive(Default)]
struct MockChannel {
    /// Number of upcoming opens that fail
    fail_opens: AtomicU32,
    opens: AtomicU32,
    /// Frames received, tagged with the session (1-based) they arrived on
    sent: Arc<Mutex<Vec<(u32, ControlFrame)>>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<ServerCmd>>>,
}

impl MockChannel {
    fn frames(&self) -> Vec<(u32, ControlFrame)> {
        self.sent.lock().unwrap().clone()
    }

    fn subscribes_for(&self, topic: &str) -> Vec<u32> {
        self.frames()
            .into_iter()
            .filter_map(|(session, frame)| match frame {
                ControlFrame::Subscribe { topic: t } if t == topic => Some(session),
                _ => None,
            })
            .collect()
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn server(&self, cmd: ServerCmd) {
        let sessions = self.sessions.lock().unwrap();
        let current = sessions.last().expect("no session opened");
        let _ = current.send(cmd);
    }
}

#[async_trait]
impl PushChannel for MockChannel {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn PushLink>, SyncError> {
        assert_eq!(credentials.access_token, "token-1");
        self.opens.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::NetworkUnavailable("no route".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(tx);
        Ok(Box::new(MockLink {
            session: sessions.len() as u32,
            sent: Arc::clone(&self.sent),
            inbound: rx,
        }))
    }
}

struct MockLink {
    session: u32,
    sent: Arc<Mutex<Vec<(u32, ControlFrame)>>>,
    inbound: mpsc::UnboundedReceiver<ServerCmd>,
}

#[async_trait]
impl PushLink for MockLink {
    async fn send(&mut self, frame: &ControlFrame) -> Result<(), SyncError> {
        self.sent.lock().unwrap().push((self.session, frame.clone()));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Result<PushEvent, SyncError>> {
        match self.inbound.recv().await {
            Some(ServerCmd::Event(event)) => Some(Ok(event)),
            Some(ServerCmd::Fail) => Some(Err(SyncError::NetworkUnavailable("reset".into()))),
            Some(ServerCmd::Close) | None => None,
        }
    }

    async fn close(&mut self) {}
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_delays_ms: vec![5, 10, 20],
        max_attempts: 5,
        heartbeat_interval_ms: 60_000,
        connect_timeout_ms: 500,
    }
}

fn credentials() -> Credentials {
    Credentials::bearer("token-1")
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .unwrap();
}

#[tokio::test]
async fn test_connect_replays_subscriptions_once_per_session() {
    let channel = Arc::new(MockChannel::default());
    let manager = ConnectionManager::new(channel.clone(), fast_config());

    let received = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&received);
    let _hotspots = manager.subscribe("hotspots", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let _alerts = manager.subscribe("alerts", |_| {});

    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;
    eventually("initial replay", || channel.subscribes_for("alerts").len() == 1).await;
    assert_eq!(channel.subscribes_for("hotspots"), vec![1]);

    // Server drops the connection; the manager comes back and replays again
    channel.server(ServerCmd::Close);
    eventually("second session", || channel.session_count() == 2).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    eventually("second replay", || channel.subscribes_for("hotspots").len() == 2).await;
    assert_eq!(channel.subscribes_for("hotspots"), vec![1, 2]);
    assert_eq!(channel.subscribes_for("alerts"), vec![1, 2]);

    channel.server(ServerCmd::Event(PushEvent::new("hotspots", json!({"n": 1}))));
    eventually("event dispatch", || received.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1, "handler must run exactly once");

    manager.disconnect().await;
}

#[tokio::test]
async fn test_topic_frames_only_on_first_and_last_handler() {
    let channel = Arc::new(MockChannel::default());
    let manager = ConnectionManager::new(channel.clone(), fast_config());
    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;

    let first = manager.subscribe("alerts", |_| {});
    let second = manager.subscribe("alerts", |_| {});
    eventually("subscribe frame", || channel.subscribes_for("alerts").len() == 1).await;

    first.unsubscribe();
    assert_eq!(manager.topics(), vec!["alerts".to_string()]);

    second.unsubscribe();
    assert!(manager.topics().is_empty());
    eventually("unsubscribe frame", || {
        channel
            .frames()
            .iter()
            .any(|(_, f)| *f == ControlFrame::Unsubscribe { topic: "alerts".into() })
    })
    .await;

    let unsubscribes = channel
        .frames()
        .iter()
        .filter(|(_, f)| matches!(f, ControlFrame::Unsubscribe { .. }))
        .count();
    assert_eq!(unsubscribes, 1);
    assert_eq!(channel.subscribes_for("alerts").len(), 1);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_dispatch_reaches_every_handler_of_topic_only() {
    let channel = Arc::new(MockChannel::default());
    let manager = ConnectionManager::new(channel.clone(), fast_config());

    let hits = Arc::new(Mutex::new(Vec::new()));
    let (a, b, c) = (hits.clone(), hits.clone(), hits.clone());
    let _h1 = manager.subscribe("hotspots", move |e| a.lock().unwrap().push(("h1", e.payload.clone())));
    let _h2 = manager.subscribe("hotspots", move |e| b.lock().unwrap().push(("h2", e.payload.clone())));
    let _h3 = manager.subscribe("alerts", move |e| c.lock().unwrap().push(("h3", e.payload.clone())));

    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;

    channel.server(ServerCmd::Event(PushEvent::new("hotspots", json!(7))));
    channel.server(ServerCmd::Event(PushEvent::new("unknown", json!(8))));
    eventually("two deliveries", || hits.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let hits = hits.lock().unwrap().clone();
    assert_eq!(hits, vec![("h1", json!(7)), ("h2", json!(7))]);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_failed_attempts_back_off_then_connect() {
    let channel = Arc::new(MockChannel::default());
    channel.fail_opens.store(2, Ordering::SeqCst);
    let manager = ConnectionManager::new(channel.clone(), fast_config());
    let mut transitions = manager.subscribe_state();

    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(channel.opens.load(Ordering::SeqCst), 3);

    let mut seen = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        seen.push(state);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );

    manager.disconnect().await;
}

#[tokio::test]
async fn test_parks_in_error_until_manual_reconnect() {
    let channel = Arc::new(MockChannel::default());
    channel.fail_opens.store(100, Ordering::SeqCst);
    let mut config = fast_config();
    config.max_attempts = 3;
    let manager = ConnectionManager::new(channel.clone(), config);

    manager.connect(credentials());
    eventually("three attempts", || channel.opens.load(Ordering::SeqCst) == 3).await;
    wait_for_state(&manager, ConnectionState::Error).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.opens.load(Ordering::SeqCst), 3);
    assert_eq!(manager.state(), ConnectionState::Error);

    channel.fail_opens.store(0, Ordering::SeqCst);
    eventually("supervisor to stop", || manager.reconnect()).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(channel.opens.load(Ordering::SeqCst), 4);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_is_noop_while_active() {
    let channel = Arc::new(MockChannel::default());
    let manager = ConnectionManager::new(channel.clone(), fast_config());
    assert!(!manager.reconnect(), "no credentials yet");

    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert!(!manager.reconnect());
    assert_eq!(channel.opens.load(Ordering::SeqCst), 1);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.reconnect());
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(channel.opens.load(Ordering::SeqCst), 2);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_cancels_backoff_sleep() {
    let channel = Arc::new(MockChannel::default());
    channel.fail_opens.store(1, Ordering::SeqCst);
    let mut config = fast_config();
    config.reconnect_delays_ms = vec![60_000];
    let manager = ConnectionManager::new(channel.clone(), config);

    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    tokio::time::timeout(Duration::from_secs(1), manager.disconnect())
        .await
        .expect("disconnect must not wait out the backoff");
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(channel.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_link_error_reconnects() {
    let channel = Arc::new(MockChannel::default());
    let manager = ConnectionManager::new(channel.clone(), fast_config());
    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;

    channel.server(ServerCmd::Fail);
    eventually("second session", || channel.session_count() == 2).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_only_while_connected() {
    let channel = Arc::new(MockChannel::default());
    let mut config = fast_config();
    config.heartbeat_interval_ms = 5;
    let manager = ConnectionManager::new(channel.clone(), config);

    manager.connect(credentials());
    wait_for_state(&manager, ConnectionState::Connected).await;
    eventually("pings", || {
        channel
            .frames()
            .iter()
            .filter(|(_, f)| *f == ControlFrame::Ping)
            .count()
            >= 2
    })
    .await;

    manager.disconnect().await;
    let pings = channel.frames().len();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(channel.frames().len(), pings);
}

#[test]
fn test_reconnect_delay_tiers() {
    let config = ConnectionConfig::default();
    assert_eq!(config.reconnect_delay(0), Duration::from_secs(3));
    assert_eq!(config.reconnect_delay(1), Duration::from_secs(3));
    assert_eq!(config.reconnect_delay(2), Duration::from_secs(6));
    assert_eq!(config.reconnect_delay(5), Duration::from_secs(30));
    assert_eq!(config.reconnect_delay(50), Duration::from_secs(30));
}
