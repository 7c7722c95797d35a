//! Event bus (C9) — single-writer broadcast of internal lifecycle events.
//!
//! Grounded on the same shape as an `AppEvent` union with a single emitter
//! port: one canonical enum, multiple subscribers, synchronous in-order
//! delivery. Unlike a typed emitter trait per event *kind*, §4.9 calls for a
//! single process-wide instance with several named channels; we model that
//! as one enum so delivery order across channels is observable and testable.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use crate::ids::{EventId, UtteranceId};

/// An event published on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The transport's connection state changed.
    ConnectionState(crate::transport::ConnectionState),
    /// The server's connection-ack frame latched a session id.
    ConnectionAck { session_id: String },
    /// An utterance began streaming.
    ResponseStart { utterance_id: UtteranceId },
    /// A chunk of an utterance arrived (published for observers, not audio itself).
    ResponseChunk {
        utterance_id: UtteranceId,
        arrival_sequence: u64,
    },
    /// An utterance finished streaming normally.
    ResponseComplete { utterance_id: UtteranceId },
    /// An utterance was interrupted by the server.
    ResponseInterrupt { utterance_id: UtteranceId },
    /// An utterance was stopped by the server.
    ResponseStop { utterance_id: UtteranceId },
    /// A protocol-level or connection-level error.
    Error {
        code: Option<String>,
        message: String,
        event_id: Option<EventId>,
    },
}

type Subscriber = Box<dyn Fn(&BusEvent) + Send + Sync>;

/// Process-wide single-instance broadcaster.
///
/// Delivery is synchronous, in subscribe order. A panicking subscriber is
/// caught and logged; it does not prevent later subscribers from running.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns nothing — there is no unsubscribe;
    /// callers that need to stop listening should gate on an internal flag.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(f));
    }

    /// Publish an event to every subscriber, in subscribe order.
    pub fn publish(&self, event: BusEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                tracing::error!("event bus subscriber panicked; continuing");
            }
        }
    }

    /// Number of currently registered subscribers (test/diagnostic use).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        bus.subscribe(move |_| o1.lock().unwrap().push(1));
        let o2 = Arc::clone(&order);
        bus.subscribe(move |_| o2.lock().unwrap().push(2));

        bus.publish(BusEvent::ResponseComplete {
            utterance_id: UtteranceId::new(),
        });
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn a_panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(BusEvent::ResponseComplete {
            utterance_id: UtteranceId::new(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
