//! Shutdown coordination for background tasks and pending waits.

use tokio::sync::watch;

/// Coordinator for cancelling sleeps, attempts and loops.
///
/// Backed by a watch channel so a signal taken after `trigger` still observes
/// the shutdown.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Get a signal that resolves once shutdown is triggered.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Wait until shutdown is triggered (or the coordinator is dropped).
    ///
    /// Cancel-safe; usable as a `tokio::select!` branch.
    pub async fn triggered(&mut self) {
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return std::future::pending().await,
        };
        if *rx.borrow_and_update() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow_and_update() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_after_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_triggered());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("signal should resolve");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_late_signal_sees_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut signal = shutdown.signal();
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("late signal should resolve immediately");
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let mut signal = ShutdownSignal::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.triggered()).await;
        assert!(waited.is_err());
    }
}
