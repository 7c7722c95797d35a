//! Transport client (C1) — owns one outbound binary stream, reconnect, and
//! the latent-send queue.
//!
//! Grounded on the `connection_handler` reconnect loop pattern (select over
//! outgoing work, a liveness interval, and the read half) but generalized
//! to the state machine, latent-send waiters, and close-code discipline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::config::TransportConfig;
use crate::error::VoiceChatError;

use super::network_monitor::NetworkMonitor;
use super::state::{ConnectionState, ReconnectCounter};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Outbound {
    frame: Vec<u8>,
    ack: oneshot::Sender<Result<(), VoiceChatError>>,
}

enum ClosedReason {
    Clean,
    Abnormal,
}

struct Inner {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    data_tx: broadcast::Sender<Vec<u8>>,
    url: Mutex<Option<String>>,
    reconnect_enabled: AtomicBool,
    torn_down: AtomicBool,
    waiters: Mutex<VecDeque<oneshot::Sender<Result<(), VoiceChatError>>>>,
    network: Arc<NetworkMonitor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn resolve_waiters(&self, result: Result<(), VoiceChatError>) {
        let mut waiters = self.waiters.lock().unwrap();
        for waiter in waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn register_waiter(&self, tx: oneshot::Sender<Result<(), VoiceChatError>>) {
        self.waiters.lock().unwrap().push_back(tx);
    }
}

/// Owns exactly one outbound bidirectional binary stream at a time.
pub struct TransportClient {
    inner: Arc<Inner>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
}

impl TransportClient {
    #[must_use]
    pub fn new(config: TransportConfig, network: Arc<NetworkMonitor>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (data_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                data_tx,
                url: Mutex::new(None),
                reconnect_enabled: AtomicBool::new(false),
                torn_down: AtomicBool::new(true),
                waiters: Mutex::new(VecDeque::new()),
                network,
                shutdown_tx,
            }),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to incoming binary frames.
    #[must_use]
    pub fn subscribe_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.data_tx.subscribe()
    }

    /// Open the connection. The first attempt is made inline: on failure the
    /// client moves to `error` and returns the failure; on success a
    /// background task takes over running the connection (and any later
    /// reconnects).
    pub async fn connect(&self, url: &str) -> Result<(), VoiceChatError> {
        if !self.inner.network.is_online() {
            return Err(VoiceChatError::NetworkUnavailable);
        }
        if matches!(
            self.inner.state(),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return Ok(());
        }

        *self.inner.url.lock().unwrap() = Some(url.to_owned());
        self.inner.reconnect_enabled.store(true, Ordering::SeqCst);
        self.inner.torn_down.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);

        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => {
                tracing::info!(url, "transport connected");
                self.inner.set_state(ConnectionState::Connected);
                self.inner.resolve_waiters(Ok(()));

                let outbound_rx = self
                    .outbound_rx
                    .lock()
                    .unwrap()
                    .take()
                    .expect("supervisor only spawned once per client");
                let inner = Arc::clone(&self.inner);
                tokio::spawn(supervise(inner, stream, outbound_rx));
                Ok(())
            }
            Err(e) => {
                tracing::error!(url, error = %e, "transport open failed");
                self.inner.set_state(ConnectionState::Error);
                Err(VoiceChatError::SendFailed(e.to_string()))
            }
        }
    }

    /// Close the connection. `clear` forgets the remembered URL, so no
    /// future reconnect attempt (automatic or latent-send-triggered) will
    /// fire until the caller calls `connect` again.
    pub fn disconnect(&self, clear: bool) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        if clear {
            *self.inner.url.lock().unwrap() = None;
            self.inner.torn_down.store(true, Ordering::SeqCst);
        }
        let _ = self.inner.shutdown_tx.send(());
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.resolve_waiters(Err(VoiceChatError::NotConnected));
    }

    /// Send one frame. If not connected, attempts to connect (when a
    /// remembered URL exists and the network is online) and waits for the
    /// connection, up to `connection_timeout`.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), VoiceChatError> {
        if self.inner.state() == ConnectionState::Connected {
            return self.write_now(frame).await;
        }

        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(VoiceChatError::NotConnected);
        }

        if !matches!(
            self.inner.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            let url = self.inner.url.lock().unwrap().clone();
            match url {
                Some(url) => {
                    // Ignore the immediate result: a failure here still
                    // leaves the waiter below to time out with the right
                    // error, and a race with a concurrent connect() is
                    // harmless since connect() is idempotent while pending.
                    let _ = self.connect(&url).await;
                }
                None => return Err(VoiceChatError::NotConnected),
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner.register_waiter(tx);

        match tokio::time::timeout(self.inner.config.connection_timeout, rx).await {
            Ok(Ok(Ok(()))) => self.write_now(frame).await,
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(VoiceChatError::NotConnected),
            Err(_) => Err(VoiceChatError::ConnectionTimeout),
        }
    }

    async fn write_now(&self, frame: Vec<u8>) -> Result<(), VoiceChatError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound { frame, ack: ack_tx })
            .map_err(|_| VoiceChatError::NotConnected)?;
        ack_rx.await.map_err(|_| VoiceChatError::NotConnected)?
    }
}

/// Runs the connection (and, on unexpected loss, the reconnect loop) until
/// the user tears it down or reconnect attempts are exhausted.
async fn supervise(inner: Arc<Inner>, first_stream: WsStream, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut stream = first_stream;
    let mut counter = ReconnectCounter::new(&inner.config);

    loop {
        let reason = run_connected(&inner, &mut stream, &mut outbound_rx).await;

        match reason {
            ClosedReason::Clean => {
                inner.set_state(ConnectionState::Disconnected);
                inner.resolve_waiters(Err(VoiceChatError::NotConnected));
                return;
            }
            ClosedReason::Abnormal => {
                tracing::warn!("transport closed abnormally (code 1006)");
                if inner.torn_down.load(Ordering::SeqCst)
                    || !inner.reconnect_enabled.load(Ordering::SeqCst)
                    || !inner.network.is_online()
                {
                    inner.set_state(ConnectionState::Disconnected);
                    inner.resolve_waiters(Err(VoiceChatError::NotConnected));
                    return;
                }
            }
        }

        inner.set_state(ConnectionState::Reconnecting);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        loop {
            if !inner.network.is_online() {
                let mut net_rx = inner.network.subscribe();
                tokio::select! {
                    _ = wait_for_online(&mut net_rx) => {}
                    _ = shutdown_rx.recv() => {
                        inner.set_state(ConnectionState::Disconnected);
                        inner.resolve_waiters(Err(VoiceChatError::NotConnected));
                        return;
                    }
                }
            }

            let Some(delay) = counter.next_delay() else {
                tracing::error!("reconnect attempts exhausted");
                inner.set_state(ConnectionState::Error);
                inner.resolve_waiters(Err(VoiceChatError::ReconnectExhausted));
                return;
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    inner.set_state(ConnectionState::Disconnected);
                    inner.resolve_waiters(Err(VoiceChatError::NotConnected));
                    return;
                }
            }

            inner.set_state(ConnectionState::Connecting);
            let url = inner.url.lock().unwrap().clone();
            let Some(url) = url else {
                inner.set_state(ConnectionState::Disconnected);
                return;
            };

            match tokio_tungstenite::connect_async(&url).await {
                Ok((new_stream, _)) => {
                    tracing::info!(url, attempt = counter.attempt(), "reconnected");
                    stream = new_stream;
                    counter.reset();
                    inner.set_state(ConnectionState::Connected);
                    inner.resolve_waiters(Ok(()));
                    break;
                }
                Err(e) => {
                    tracing::warn!(url, attempt = counter.attempt(), error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

async fn wait_for_online(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Runs one live connection: reads incoming frames onto the data bus, writes
/// outgoing frames, and pings on the liveness interval. Returns the reason
/// the connection ended.
async fn run_connected(
    inner: &Arc<Inner>,
    stream: &mut WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> ClosedReason {
    let mut liveness = tokio::time::interval(inner.config.liveness_interval);
    liveness.tick().await; // first tick fires immediately; discard it
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(outbound) = outbound else {
                    return ClosedReason::Abnormal;
                };
                let result = stream
                    .send(Message::Binary(outbound.frame.into()))
                    .await
                    .map_err(|e| VoiceChatError::SendFailed(e.to_string()));
                let abnormal = result.is_err();
                let _ = outbound.ack.send(result);
                if abnormal {
                    return ClosedReason::Abnormal;
                }
            }

            () = liveness.tick().map(|_| ()) => {
                if stream.send(Message::Ping(Vec::new().into())).await.is_err() {
                    tracing::warn!("liveness ping failed");
                    return ClosedReason::Abnormal;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = inner.data_tx.send(bytes.to_vec());
                    }
                    Some(Ok(Message::Text(_))) => {
                        tracing::warn!("dropped incoming text frame");
                    }
                    Some(Ok(Message::Close(_))) => {
                        return ClosedReason::Clean;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "transport read error");
                        return ClosedReason::Abnormal;
                    }
                    None => return ClosedReason::Abnormal,
                }
            }

            _ = shutdown_rx.recv() => {
                let close = CloseFrame { code: CloseCode::Normal, reason: "".into() };
                let _ = stream.close(Some(close)).await;
                return ClosedReason::Clean;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config() -> TransportConfig {
        let mut cfg = TransportConfig::default();
        cfg.connection_timeout = Duration::from_millis(200);
        cfg.liveness_interval = Duration::from_secs(60);
        cfg.reconnect_delays = vec![Duration::from_millis(10)];
        cfg.max_reconnect_attempts = 2;
        cfg
    }

    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((tcp, _)) = listener.accept().await {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await {
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_binary() {
                            let _ = ws.send(msg).await;
                        }
                        if msg.is_close() {
                            break;
                        }
                    }
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn connect_fails_fast_when_network_offline() {
        let network = Arc::new(NetworkMonitor::new(Duration::from_millis(1)));
        network.report(false);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let client = TransportClient::new(test_config(), network);
        let result = client.connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(VoiceChatError::NetworkUnavailable)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_and_send_round_trips_through_echo_server() {
        let url = start_echo_server().await;
        let network = Arc::new(NetworkMonitor::new(Duration::from_millis(1)));
        let client = TransportClient::new(test_config(), network);

        client.connect(&url).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let mut data_rx = client.subscribe_data();
        client.send(vec![1, 2, 3]).await.unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(1), data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn send_without_prior_connect_or_url_fails_not_connected() {
        let network = Arc::new(NetworkMonitor::new(Duration::from_millis(1)));
        let client = TransportClient::new(test_config(), network);
        let result = client.send(vec![1]).await;
        assert!(matches!(result, Err(VoiceChatError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_rejects_waiting_sends() {
        let url = start_echo_server().await;
        let network = Arc::new(NetworkMonitor::new(Duration::from_millis(1)));
        let client = TransportClient::new(test_config(), network);
        client.connect(&url).await.unwrap();
        client.disconnect(true);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let result = client.send(vec![1]).await;
        assert!(matches!(result, Err(VoiceChatError::NotConnected)));
    }
}
