//! Session manager (C6) — composes the transport, codec, handler registry,
//! and request tracker into the single send/receive surface external
//! callers use.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::bus::{BusEvent, EventBus};
use crate::codec::{self, DecodedEnvelope};
use crate::config::VoiceChatConfig;
use crate::error::VoiceChatError;
use crate::ids::EventId;
use crate::registry::HandlerRegistry;
use crate::tracker::RequestTracker;
use crate::transport::{ConnectionState, NetworkMonitor, TransportClient};

const CONNECTION_ACK_EVENT_TYPE: &str = "connection.ack";

/// Owns one transport connection and the protocol machinery layered on it.
pub struct Session {
    transport: Arc<TransportClient>,
    registry: Arc<HandlerRegistry>,
    tracker: Arc<RequestTracker>,
    bus: Arc<EventBus>,
    session_id: Arc<Mutex<Option<String>>>,
    sweeper: tokio::task::JoinHandle<()>,
    pump: tokio::task::JoinHandle<()>,
}

impl Session {
    #[must_use]
    pub fn new(config: &VoiceChatConfig, bus: Arc<EventBus>) -> Self {
        let network = Arc::new(NetworkMonitor::new(config.transport.network_debounce));
        let transport = Arc::new(TransportClient::new(config.transport.clone(), network));
        let registry = Arc::new(HandlerRegistry::new());
        let tracker = Arc::new(RequestTracker::new(
            config.tracker.max_pending,
            config.tracker.default_timeout,
        ));

        let sweeper = tracker.spawn_sweeper(config.tracker.sweep_interval);
        let session_id = Arc::new(Mutex::new(None));
        let pump = spawn_pump(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&bus),
            Arc::clone(&session_id),
        );

        Self {
            transport,
            registry,
            tracker,
            bus,
            session_id,
            sweeper,
            pump,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.transport.state() == ConnectionState::Connected && self.session_id().is_some()
    }

    pub async fn connect(&self, url: &str) -> Result<(), VoiceChatError> {
        self.transport.connect(url).await
    }

    /// Close the transport and reject every outstanding tracked request.
    /// `session_id` is dropped regardless of `clear`.
    pub fn disconnect(&self, clear: bool) {
        self.transport.disconnect(clear);
        self.tracker.clear();
        *self.session_id.lock().unwrap() = None;
    }

    /// Encode and hand off to the transport. Does not wait for an
    /// acknowledgment.
    pub async fn send(
        &self,
        event_type: &str,
        payload: Value,
        audio: Option<&[u8]>,
    ) -> Result<EventId, VoiceChatError> {
        let event_id = EventId::new();
        let session_id = self.session_id();
        let frame = codec::encode(event_type, event_id, session_id.as_deref(), &payload, audio);
        self.transport.send(frame).await?;
        Ok(event_id)
    }

    /// Encode, register the request with the tracker before sending, and
    /// resolve on matched acknowledgment or timeout.
    pub async fn send_with_ack(
        &self,
        event_type: &str,
        payload: Value,
        audio: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Value, VoiceChatError> {
        let event_id = EventId::new();
        let session_id = self.session_id();
        let frame = codec::encode(event_type, event_id, session_id.as_deref(), &payload, audio);

        let tracked = self.tracker.track(event_id, event_type, timeout);
        tokio::pin!(tracked);

        if let Err(e) = self.transport.send(frame).await {
            self.tracker.cancel(event_id);
            return Err(e);
        }
        tracked.await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.pump.abort();
    }
}

/// Background task: forwards transport state transitions and decoded
/// incoming frames through the dispatch pipeline described in the protocol
/// design (ack-match before routing, connection-ack latching session id).
fn spawn_pump(
    transport: Arc<TransportClient>,
    registry: Arc<HandlerRegistry>,
    tracker: Arc<RequestTracker>,
    bus: Arc<EventBus>,
    session_id_slot: Arc<Mutex<Option<String>>>,
) -> tokio::task::JoinHandle<()> {
    let mut state_rx = transport.subscribe_state();
    let mut data_rx = transport.subscribe_data();

    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    return;
                }
                let state = *state_rx.borrow();
                bus.publish(BusEvent::ConnectionState(state));
            }
        });
    }

    tokio::spawn(async move {
        loop {
            let raw = match data_rx.recv().await {
                Ok(raw) => raw,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "session pump lagged behind incoming frames");
                    continue;
                }
            };

            let decoded = match codec::decode(&raw) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            dispatch(&decoded, &raw, &registry, &tracker, &bus, &session_id_slot);
        }
    })
}

fn dispatch(
    decoded: &DecodedEnvelope<'_>,
    raw: &[u8],
    registry: &Arc<HandlerRegistry>,
    tracker: &Arc<RequestTracker>,
    bus: &Arc<EventBus>,
    session_id_slot: &Arc<Mutex<Option<String>>>,
) {
    if decoded.event_type == CONNECTION_ACK_EVENT_TYPE {
        if let Some(session_id) = decoded.payload.get("session_id").and_then(Value::as_str) {
            *session_id_slot.lock().unwrap() = Some(session_id.to_owned());
            bus.publish(BusEvent::ConnectionAck {
                session_id: session_id.to_owned(),
            });
        }
    }

    if decoded.is_ack() && tracker.match_ack(decoded.event_id, decoded.payload.clone()) {
        return;
    }

    registry.route(raw, &decoded.event_type, decoded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ack_event_type_matches_wire_protocol_constant() {
        assert_eq!(CONNECTION_ACK_EVENT_TYPE, "connection.ack");
    }
}
