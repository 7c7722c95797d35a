//! Recording orchestrator (C10) — wires the session, capture pipeline, and
//! playback sequencer into the single record/playback lifecycle external
//! callers drive.
//!
//! This is the only module that registers handlers for the
//! `voicechat.response.*` wire event family; everything else in the crate
//! is protocol machinery that doesn't know audio exists.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use crate::bus::BusEvent;
use crate::codec::DecodedEnvelope;
use crate::config::CaptureConfig;
use crate::capture::CapturePipeline;
use crate::error::VoiceChatError;
use crate::ids::UtteranceId;
use crate::playback::{MAX_SAMPLE_RATE, PlaybackSequencer};
use crate::session::Session;

const AUDIO_START_TIMEOUT: Duration = Duration::from_secs(10);
const AUDIO_END_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates one recording session: microphone capture in, server
/// responses out, with the session's transport and protocol layer as the
/// only path between them.
pub struct Orchestrator {
    session: Arc<Session>,
    capture: Arc<CapturePipeline>,
    sequencer: Arc<PlaybackSequencer>,
    capture_config: CaptureConfig,
    recording: AtomicBool,
    frame_pump: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the orchestrator and registers its response-event handlers on
    /// `session`'s registry. `session` is expected to already be connected,
    /// or to become connected later — handlers are inert until traffic
    /// arrives.
    pub fn new(session: Arc<Session>, capture_config: CaptureConfig) -> Result<Arc<Self>, VoiceChatError> {
        let sequencer = Arc::new(PlaybackSequencer::new()?);
        let orchestrator = Arc::new(Self {
            session,
            capture: Arc::new(CapturePipeline::new()),
            sequencer,
            capture_config,
            recording: AtomicBool::new(false),
            frame_pump: std::sync::Mutex::new(None),
        });
        orchestrator.register_response_handlers();
        Ok(orchestrator)
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Start a recording session: begin capture, learn the device's actual
    /// sample rate, and announce it to the server. Capture is stopped again
    /// if the announcement fails.
    pub async fn start_recording(&self) -> Result<(), VoiceChatError> {
        if !self.session.is_ready() {
            return Err(VoiceChatError::NotConnected);
        }
        if self.recording.swap(true, Ordering::SeqCst) {
            return Err(VoiceChatError::AlreadyCapturing);
        }

        let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let actual_rate = match self
            .capture
            .start(&self.capture_config, move |bytes: &[u8]| frame_tx.send(bytes.to_vec()).is_ok())
        {
            Ok(rate) => rate,
            Err(e) => {
                self.recording.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let session = Arc::clone(&self.session);
        let pump = tokio::spawn(async move {
            while let Some(bytes) = frame_rx.recv().await {
                let payload = json!({ "isMuted": false });
                if let Err(e) = session.send("voicechat.audio.chunk", payload, Some(&bytes)).await {
                    tracing::warn!(error = %e, "failed to send audio chunk; capture continues");
                }
            }
        });
        *self.frame_pump.lock().unwrap() = Some(pump);

        let ack = self
            .session
            .send_with_ack(
                "voicechat.audio.start",
                json!({
                    "samplingRate": actual_rate,
                    "language": self.capture_config.default_language,
                }),
                None,
                Some(AUDIO_START_TIMEOUT),
            )
            .await;

        if let Err(e) = ack {
            self.capture.stop();
            self.recording.store(false, Ordering::SeqCst);
            if let Some(pump) = self.frame_pump.lock().unwrap().take() {
                pump.abort();
            }
            return Err(e);
        }

        Ok(())
    }

    /// Stop capture locally first, then tell the server. The local stop is
    /// never undone even if the server acknowledgment fails or times out —
    /// only the failure is surfaced to the caller.
    pub async fn stop_recording(&self) -> Result<(), VoiceChatError> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.capture.stop();
        if let Some(pump) = self.frame_pump.lock().unwrap().take() {
            pump.abort();
        }

        self.session
            .send_with_ack("voicechat.audio.end", json!({}), None, Some(AUDIO_END_TIMEOUT))
            .await
            .map(|_| ())
    }

    fn register_response_handlers(self: &Arc<Self>) {
        let registry = self.session.registry();

        {
            let orchestrator = Arc::clone(self);
            registry.register(
                "voicechat.response.start",
                Box::new(move |_raw, decoded| orchestrator.on_response_start(decoded)),
            );
        }
        {
            let orchestrator = Arc::clone(self);
            registry.register(
                "voicechat.response.chunk",
                Box::new(move |_raw, decoded| orchestrator.on_response_chunk(decoded)),
            );
        }
        {
            let orchestrator = Arc::clone(self);
            registry.register(
                "voicechat.response.complete",
                Box::new(move |_raw, decoded| orchestrator.on_response_complete(decoded)),
            );
        }
        {
            let orchestrator = Arc::clone(self);
            registry.register(
                "voicechat.response.interrupt",
                Box::new(move |_raw, decoded| orchestrator.on_response_interrupted_or_stopped(decoded, true)),
            );
        }
        {
            let orchestrator = Arc::clone(self);
            registry.register(
                "voicechat.response.stop",
                Box::new(move |_raw, decoded| orchestrator.on_response_interrupted_or_stopped(decoded, false)),
            );
        }
        {
            let orchestrator = Arc::clone(self);
            registry.register_error(
                "voicechat.response",
                Box::new(move |_raw, decoded| orchestrator.on_response_error(decoded)),
            );
        }
    }

    fn on_response_start(&self, decoded: &DecodedEnvelope<'_>) -> Result<(), VoiceChatError> {
        let utterance_id = parse_utterance_id(&decoded.payload)?;
        self.sequencer.stop();
        self.session.bus().publish(BusEvent::ResponseStart { utterance_id });
        Ok(())
    }

    fn on_response_chunk(&self, decoded: &DecodedEnvelope<'_>) -> Result<(), VoiceChatError> {
        let utterance_id = parse_utterance_id(&decoded.payload)?;
        let Some(audio) = decoded.audio else {
            return Err(VoiceChatError::InvalidAudioPayload(
                "response.chunk carried no audio bytes".into(),
            ));
        };
        let requested_rate = decoded
            .payload
            .get("sampleRate")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(self.capture_config.requested_sample_rate);
        let sample_rate = normalize_sample_rate(requested_rate, self.capture_config.requested_sample_rate);

        self.sequencer.play_chunk(audio, sample_rate, utterance_id);
        Ok(())
    }

    fn on_response_complete(&self, decoded: &DecodedEnvelope<'_>) -> Result<(), VoiceChatError> {
        let utterance_id = parse_utterance_id(&decoded.payload)?;
        self.session.bus().publish(BusEvent::ResponseComplete { utterance_id });
        Ok(())
    }

    fn on_response_interrupted_or_stopped(
        &self,
        decoded: &DecodedEnvelope<'_>,
        interrupted: bool,
    ) -> Result<(), VoiceChatError> {
        let utterance_id = parse_utterance_id(&decoded.payload)?;
        self.sequencer.stop();
        let event = if interrupted {
            BusEvent::ResponseInterrupt { utterance_id }
        } else {
            BusEvent::ResponseStop { utterance_id }
        };
        self.session.bus().publish(event);
        Ok(())
    }

    fn on_response_error(&self, decoded: &DecodedEnvelope<'_>) -> Result<(), VoiceChatError> {
        let code = decoded.payload.get("code").and_then(Value::as_str).map(str::to_owned);
        let message = decoded
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("response error")
            .to_owned();
        self.session.bus().publish(BusEvent::Error {
            code,
            message,
            event_id: Some(decoded.event_id),
        });
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(pump) = self.frame_pump.lock().unwrap().take() {
            pump.abort();
        }
    }
}

fn parse_utterance_id(payload: &Value) -> Result<UtteranceId, VoiceChatError> {
    payload
        .get("utteranceId")
        .and_then(Value::as_str)
        .ok_or_else(|| VoiceChatError::DecodeError("missing utteranceId".into()))?
        .parse()
        .map_err(|_| VoiceChatError::DecodeError("malformed utteranceId".into()))
}

fn normalize_sample_rate(requested: u32, default: u32) -> u32 {
    if requested == 0 || requested > MAX_SAMPLE_RATE {
        tracing::warn!(requested, default, "out-of-range sample rate on response chunk; using default");
        default
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_sample_rate_falls_back_when_out_of_range() {
        assert_eq!(normalize_sample_rate(0, 16_000), 16_000);
        assert_eq!(normalize_sample_rate(300_000, 16_000), 16_000);
        assert_eq!(normalize_sample_rate(48_000, 16_000), 48_000);
    }

    #[test]
    fn parse_utterance_id_rejects_missing_field() {
        let result = parse_utterance_id(&json!({}));
        assert!(matches!(result, Err(VoiceChatError::DecodeError(_))));
    }

    #[test]
    fn parse_utterance_id_round_trips_known_value() {
        let id = UtteranceId::new();
        let payload = json!({ "utteranceId": id.to_string() });
        assert_eq!(parse_utterance_id(&payload).unwrap(), id);
    }
}
