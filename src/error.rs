//! Error taxonomy for the voice-chat protocol and stream engine.

/// Errors surfaced by the transport, session, tracker, capture, and playback
/// subsystems.
///
/// Variants correspond to the error kinds named in the protocol design: each
/// one is recovered locally, surfaced to the caller, or surfaced to the event
/// bus depending on where it originates (see the module that returns it).
#[derive(Debug, Clone, thiserror::Error)]
pub enum VoiceChatError {
    /// The network monitor reports offline at the time `connect` was called.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// A send was attempted (or a connection waiter timed out) while not connected.
    #[error("not connected")]
    NotConnected,

    /// A connection waiter did not resolve before its timeout elapsed.
    #[error("connection timeout")]
    ConnectionTimeout,

    /// The reconnect attempt counter reached its configured maximum.
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,

    /// The underlying transport rejected a write.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A frame failed to decode and was dropped.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// A tracked request's deadline elapsed before a matching acknowledgment arrived.
    #[error("request timed out")]
    RequestTimeout,

    /// The pending-request map was at capacity and the oldest entry was evicted.
    #[error("tracker capacity exceeded")]
    TrackerLimit,

    /// The tracker was cleared (session torn down) while requests were outstanding.
    #[error("tracker cleared")]
    TrackerCleared,

    /// The microphone could not be opened due to a permission restriction.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// No input device is available.
    #[error("no capture device available")]
    NoDevice,

    /// `start` was called on a capture pipeline that is already running.
    #[error("capture already in progress")]
    AlreadyCapturing,

    /// A chunk declared a sample rate outside `(0, 192000]`.
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    /// A chunk's audio payload failed validation (empty, non-finite samples, ...).
    #[error("invalid audio payload: {0}")]
    InvalidAudioPayload(String),

    /// The output context could not be resumed from a suspended state.
    #[error("audio output context suspended")]
    AudioContextSuspended,

    /// A registered handler panicked or returned an error while routing a message.
    #[error("handler exception: {0}")]
    HandlerException(String),

    /// No handler matched a decoded event.
    #[error("unhandled event: {0}")]
    UnhandledEvent(String),

    /// The request was cancelled by the caller before it settled.
    #[error("request cancelled")]
    Cancelled,

    /// The output stream could not be opened.
    #[error("output stream error: {0}")]
    OutputStreamError(String),

    /// The audio I/O thread died (its channel disconnected).
    #[error("audio thread died")]
    AudioThreadDied,
}
