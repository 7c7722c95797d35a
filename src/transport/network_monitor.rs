//! Network-status monitor (C2) — debounced online/offline observable.
//!
//! There is no portable platform signal in this crate's scope (that lives in
//! whatever embeds us), so [`NetworkMonitor`] exposes [`NetworkMonitor::report`]
//! for the host to feed raw signal changes in, and debounces them itself.
//! Grounded on the same watch-channel-as-observable shape used for connection
//! state in [`super::client`]; a single current value, multiple subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// Debounced boolean network-reachability observable.
///
/// Initial value is `true` (online) — assumed online when no platform signal
/// is available, per design.
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
    debounce: Duration,
    generation: Arc<AtomicU64>,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        let (tx, _rx) = watch::channel(true);
        Self {
            tx,
            debounce,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Report a raw signal reading from the host platform. The value is only
    /// committed to the observable if it still holds after `debounce`
    /// elapses, collapsing flapping transitions into a single update.
    pub fn report(&self, online: bool) {
        if online == self.is_online() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let tx = self.tx.clone();
        let debounce = self.debounce;
        let gen_counter = Arc::clone(&self.generation);

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // A later `report` call superseded this one before it settled.
            if gen_counter.load(Ordering::SeqCst) != generation {
                return;
            }
            if *tx.borrow() != online {
                tracing::debug!(online, "network monitor: committing debounced transition");
                let _ = tx.send(online);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settles_to_final_value_after_debounce() {
        let monitor = NetworkMonitor::new(Duration::from_millis(20));
        assert!(monitor.is_online());

        monitor.report(false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn flapping_within_debounce_window_collapses_to_latest() {
        let monitor = NetworkMonitor::new(Duration::from_millis(30));

        monitor.report(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.report(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.report(false);

        // Still within the debounce window of the *last* report.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.is_online(), "should not have committed yet");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn subscriber_observes_committed_transition() {
        let monitor = NetworkMonitor::new(Duration::from_millis(10));
        let mut rx = monitor.subscribe();

        monitor.report(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
