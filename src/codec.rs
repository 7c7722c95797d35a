//! Binary frame codec (C3).
//!
//! Each wire frame is `[u32 LE header_len][header_len bytes of JSON header][remaining bytes: raw audio, if any]`.
//! Keeping the audio payload out of the JSON (no base64) avoids a third of
//! the frame being spent on encoding overhead, mirroring how chunked PCM is
//! carried over a voice WebSocket in practice.
//!
//! # Aliasing (load-bearing — see design notes)
//!
//! [`decode`] borrows its `audio` field directly out of the input slice
//! instead of copying it. This is deliberate: the codec does not know
//! whether the caller will retain the decoded value past the lifetime of the
//! receive buffer, and copying unconditionally would cost every hot-path
//! caller (the session manager, the handler registry) a copy they don't
//! need. Any consumer that keeps a [`DecodedEnvelope`] (or its `audio`
//! slice) beyond the call that produced it — notably the playback sequencer
//! enqueueing a chunk — must materialise an owned copy itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VoiceChatError;
use crate::ids::EventId;

const HEADER_LEN_BYTES: usize = 4;

/// The non-binary fields of a wire frame, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireHeader {
    event_type: String,
    event_id: EventId,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// A decoded wire frame.
///
/// `audio`, when present, borrows from the buffer passed to [`decode`] — see
/// the module-level aliasing note before retaining it.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope<'a> {
    pub event_type: String,
    pub event_id: EventId,
    pub session_id: Option<String>,
    pub payload: Value,
    pub audio: Option<&'a [u8]>,
}

impl DecodedEnvelope<'_> {
    /// A decoded message is an acknowledgment when its payload carries
    /// `success: true`. This does not require a matching pending request —
    /// that check belongs to the request tracker.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this message's event type is an error event (`*.error`).
    #[must_use]
    pub fn is_error_event(&self) -> bool {
        self.event_type.ends_with(".error")
    }
}

/// Encode a frame. Deterministic for a given input: identical arguments
/// always produce identical bytes.
pub fn encode(
    event_type: &str,
    event_id: EventId,
    session_id: Option<&str>,
    payload: &Value,
    audio: Option<&[u8]>,
) -> Vec<u8> {
    let header = WireHeader {
        event_type: event_type.to_owned(),
        event_id,
        session_id: session_id.map(str::to_owned),
        payload: payload.clone(),
    };
    // `WireHeader` serialization can't fail: every field is a plain string,
    // ULID, or already-valid `Value`.
    let header_bytes = serde_json::to_vec(&header).expect("header is always serializable");
    let header_len = u32::try_from(header_bytes.len()).expect("header fits in u32");

    let audio = audio.unwrap_or(&[]);
    let mut frame = Vec::with_capacity(HEADER_LEN_BYTES + header_bytes.len() + audio.len());
    frame.extend_from_slice(&header_len.to_le_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(audio);
    frame
}

/// Decode a frame. The returned `audio` slice (if any) aliases `raw` — see
/// the module-level note.
pub fn decode(raw: &[u8]) -> Result<DecodedEnvelope<'_>, VoiceChatError> {
    if raw.len() < HEADER_LEN_BYTES {
        return Err(VoiceChatError::DecodeError(
            "frame shorter than length prefix".to_owned(),
        ));
    }
    let header_len =
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let byte_offset = HEADER_LEN_BYTES;
    let header_end = byte_offset
        .checked_add(header_len)
        .filter(|&end| end <= raw.len())
        .ok_or_else(|| VoiceChatError::DecodeError("header_len exceeds frame size".to_owned()))?;

    let header: WireHeader = serde_json::from_slice(&raw[byte_offset..header_end])
        .map_err(|e| VoiceChatError::DecodeError(e.to_string()))?;

    let byte_length = raw.len() - header_end;
    let audio = if byte_length == 0 {
        None
    } else {
        Some(&raw[header_end..header_end + byte_length])
    };

    Ok(DecodedEnvelope {
        event_type: header.event_type,
        event_id: header.event_id,
        session_id: header.session_id,
        payload: header.payload,
        audio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_without_audio() {
        let id = EventId::new();
        let frame = encode(
            "connection.ack",
            id,
            None,
            &json!({"session_id": "S1"}),
            None,
        );
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.event_type, "connection.ack");
        assert_eq!(decoded.event_id, id);
        assert_eq!(decoded.session_id, None);
        assert_eq!(decoded.payload["session_id"], "S1");
        assert!(decoded.audio.is_none());
    }

    #[test]
    fn round_trip_with_audio_preserves_bytes() {
        let id = EventId::new();
        let audio: Vec<u8> = (0u8..=255).collect();
        let frame = encode(
            "voicechat.audio.chunk",
            id,
            Some("S1"),
            &json!({"isMuted": false}),
            Some(&audio),
        );
        let decoded = decode(&frame).unwrap();
        let copied = decoded.audio.unwrap().to_vec();
        assert_eq!(copied, audio);
    }

    #[test]
    fn ack_detection_requires_success_true() {
        let id = EventId::new();
        let frame = encode("audio.start", id, Some("S1"), &json!({"success": true}), None);
        assert!(decode(&frame).unwrap().is_ack());

        let frame = encode(
            "audio.start",
            id,
            Some("S1"),
            &json!({"success": false}),
            None,
        );
        assert!(!decode(&frame).unwrap().is_ack());

        let frame = encode("audio.start", id, Some("S1"), &json!({}), None);
        assert!(!decode(&frame).unwrap().is_ack());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(decode(&[0, 0]).is_err());
        assert!(decode(&[255, 0, 0, 0]).is_err());
    }

    #[test]
    fn error_event_type_detected_by_suffix() {
        let id = EventId::new();
        let frame = encode("audio.error", id, Some("S1"), &json!({}), None);
        assert!(decode(&frame).unwrap().is_error_event());
    }
}
