//! Request tracker (C5) — outstanding requests awaiting acknowledgment.
//!
//! Bounded capacity, per-request timeouts, a periodic sweep against lost
//! timer firings, and duplicate-key tolerance. Every settlement funnels
//! through [`Pending::settle`], which uses `Option::take` on the completion
//! sink to guarantee exactly-once delivery even if two code paths (a timeout
//! firing and a matching ack arriving) race.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::timeout as tokio_timeout;

use crate::error::VoiceChatError;
use crate::ids::EventId;

/// One outstanding request.
struct Pending {
    event_type: String,
    submitted_at: Instant,
    deadline: Instant,
    /// Every waiter tracking this `event_id` — duplicate `track` calls all
    /// settle together instead of the later call dropping the earlier one.
    sinks: Vec<oneshot::Sender<Result<serde_json::Value, VoiceChatError>>>,
}

impl Pending {
    fn settle(mut self, result: Result<serde_json::Value, VoiceChatError>) {
        for sink in self.sinks.drain(..) {
            let _ = sink.send(result.clone());
        }
    }
}

struct TrackerState {
    pending: HashMap<EventId, Pending>,
    /// Insertion order, for bounded-capacity eviction (oldest first).
    order: VecDeque<EventId>,
}

/// Tracks outstanding request ids awaiting acknowledgment.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    max_pending: usize,
    default_timeout: Duration,
}

impl RequestTracker {
    #[must_use]
    pub fn new(max_pending: usize, default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                pending: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_pending,
            default_timeout,
        }
    }

    /// Track `event_id`, awaiting a matching acknowledgment.
    ///
    /// Tracking an already-tracked `event_id` does not replace it: the new
    /// caller is added to the same entry's waiter list, so both settle
    /// together whenever the shared deadline or a match fires.
    ///
    /// The returned future resolves to the ack payload on match, or to an
    /// error on timeout, cancel, clear, or tracker-limit eviction.
    pub async fn track(
        &self,
        event_id: EventId,
        event_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, VoiceChatError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        let evicted = {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.pending.get_mut(&event_id) {
                entry.sinks.push(tx);
                None
            } else {
                state.pending.insert(
                    event_id,
                    Pending {
                        event_type: event_type.into(),
                        submitted_at: Instant::now(),
                        deadline,
                        sinks: vec![tx],
                    },
                );
                state.order.push_back(event_id);

                if state.order.len() > self.max_pending {
                    let oldest = state.order.pop_front().expect("just checked non-empty");
                    state.pending.remove(&oldest)
                } else {
                    None
                }
            }
        };

        if let Some(evicted) = evicted {
            evicted.settle(Err(VoiceChatError::TrackerLimit));
        }

        match tokio_timeout(timeout, rx).await {
            // The sender settled us directly (match, cancel, clear, or a
            // sweep/eviction that targeted this specific entry).
            Ok(Ok(result)) => result,
            // The sender was dropped without settling — treat as timeout.
            Ok(Err(_)) => {
                self.remove_and_settle(event_id, VoiceChatError::RequestTimeout);
                Err(VoiceChatError::RequestTimeout)
            }
            Err(_elapsed) => {
                self.remove_and_settle(event_id, VoiceChatError::RequestTimeout);
                Err(VoiceChatError::RequestTimeout)
            }
        }
    }

    /// Settle `event_id` if a decoded message is its acknowledgment.
    ///
    /// Returns `true` if a pending entry existed and was resolved with
    /// `payload`. Returns `false` when there is no matching entry — the
    /// caller should then fall through to the handler registry, per the
    /// preserved fall-through semantics in the design notes.
    pub fn match_ack(&self, event_id: EventId, payload: serde_json::Value) -> bool {
        let pending = {
            let mut state = self.state.lock().unwrap();
            let found = state.pending.remove(&event_id);
            if found.is_some() {
                state.order.retain(|id| *id != event_id);
            }
            found
        };
        match pending {
            Some(entry) => {
                entry.settle(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Cancel a single outstanding request.
    pub fn cancel(&self, event_id: EventId) {
        self.remove_and_settle(event_id, VoiceChatError::Cancelled);
    }

    /// Reject every outstanding request with `tracker-cleared`. Used on
    /// session teardown; the tracker remains usable afterwards.
    pub fn clear(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.state.lock().unwrap();
            state.order.clear();
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for entry in drained {
            entry.settle(Err(VoiceChatError::TrackerCleared));
        }
    }

    /// Reject entries whose deadline is more than `2x` their original
    /// timeout in the past — a backstop against a lost timer firing. Should
    /// be driven by a periodic tick (see [`RequestTracker::spawn_sweeper`]).
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale: Vec<EventId> = {
            let state = self.state.lock().unwrap();
            state
                .pending
                .iter()
                .filter_map(|(id, entry)| {
                    let original_timeout = entry.deadline.duration_since(entry.submitted_at);
                    let stale_after = entry.submitted_at + original_timeout * 2;
                    (now >= stale_after).then_some(*id)
                })
                .collect()
        };
        for id in stale {
            tracing::warn!(event_id = %id, "tracker sweep: rejecting stale entry");
            self.remove_and_settle(id, VoiceChatError::RequestTimeout);
        }
    }

    /// Spawn a background task that calls [`sweep`](Self::sweep) on
    /// `interval`. The task runs until the returned handle is dropped or
    /// aborted.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracker.sweep();
            }
        })
    }

    /// Current number of outstanding requests. Never exceeds `max_pending`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_and_settle(&self, event_id: EventId, err: VoiceChatError) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let found = state.pending.remove(&event_id);
            if found.is_some() {
                state.order.retain(|id| *id != event_id);
            }
            found
        };
        if let Some(entry) = entry {
            tracing::debug!(event_id = %event_id, event_type = %entry.event_type, error = %err, "settling pending request");
            entry.settle(Err(err));
        }
    }
}
