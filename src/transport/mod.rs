//! Transport layer (C1 + C2): connection state machine, reconnect policy,
//! and the debounced network-status monitor it depends on.

mod client;
mod network_monitor;
mod state;

pub use client::TransportClient;
pub use network_monitor::NetworkMonitor;
pub use state::{ConnectionState, ReconnectCounter};
