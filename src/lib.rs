//! Client-side protocol and stream engine for a real-time duplex voice
//! chat: a reconnecting transport, a binary frame codec, a handler
//! registry with error fallback, a request/ack tracker, a capture
//! pipeline, and a gap-free playback sequencer, composed by a session
//! manager and a recording orchestrator.

pub mod bus;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod playback;
pub mod registry;
pub mod session;
pub mod tracker;
pub mod transport;

pub use bus::{BusEvent, EventBus};
pub use capture::CapturePipeline;
pub use codec::DecodedEnvelope;
pub use config::VoiceChatConfig;
pub use error::VoiceChatError;
pub use ids::{EventId, UtteranceId};
pub use orchestrator::Orchestrator;
pub use playback::PlaybackSequencer;
pub use registry::HandlerRegistry;
pub use session::Session;
pub use tracker::RequestTracker;
pub use transport::{ConnectionState, TransportClient};
