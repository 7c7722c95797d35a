//! Handler registry (C4) — routes decoded messages to handlers by event
//! type, with `*.error` fallback chain.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::RwLock;

use crate::codec::DecodedEnvelope;
use crate::error::VoiceChatError;

/// A registered message handler.
///
/// Takes the raw frame bytes alongside the already-decoded structure so
/// handlers that need the wire bytes (rare) don't force a second decode.
pub type Handler =
    Box<dyn Fn(&[u8], &DecodedEnvelope<'_>) -> Result<(), VoiceChatError> + Send + Sync>;

/// Routes decoded wire messages to registered handlers.
///
/// Two maps: primary (`event_type -> handler`) and error
/// (`base_event_type -> handler`, used only for the `*.error` fallback
/// chain described in [`route`]).
#[derive(Default)]
pub struct HandlerRegistry {
    primary: RwLock<HashMap<String, Handler>>,
    error: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event_type`. Replaces any existing handler —
    /// this overwrite semantics is load-bearing for callers that re-install
    /// their handler set every time their owning scope is rebuilt (see
    /// design notes on framework-driven mount/unmount duplication).
    pub fn register(&self, event_type: impl Into<String>, handler: Handler) {
        self.primary.write().unwrap().insert(event_type.into(), handler);
    }

    /// Register a fallback handler for `base_event_type`, consulted only
    /// when routing `"{base_event_type}.error"` and no primary handler for
    /// the exact `.error` event type exists.
    pub fn register_error(&self, base_event_type: impl Into<String>, handler: Handler) {
        self.error.write().unwrap().insert(base_event_type.into(), handler);
    }

    /// Remove a handler for `event_type`, if any. No-op otherwise.
    pub fn unregister(&self, event_type: &str) {
        self.primary.write().unwrap().remove(event_type);
    }

    /// Route a decoded message.
    ///
    /// For `"X.error"`: tries primary `"X.error"`, then error-registry
    /// `"X"`, then primary wildcard `"error"`, first match wins. For any
    /// other event type: tries primary `event_type` only.
    ///
    /// A handler that returns `Err` is logged and the message is still
    /// reported as handled, to prevent the caller from re-attempting
    /// routing. Returns `false` (and logs an `unhandled-event` warning) only
    /// when no handler matched at all.
    pub fn route(&self, raw: &[u8], event_type: &str, decoded: &DecodedEnvelope<'_>) -> bool {
        match self.invoke(event_type, raw, decoded) {
            Ok(()) => true,
            Err(VoiceChatError::UnhandledEvent(_)) => {
                tracing::warn!(event_type, "unhandled-event");
                false
            }
            Err(e) => {
                tracing::error!(event_type, error = %e, "handler exception");
                true
            }
        }
    }

    /// Resolve and invoke the handler chosen by [`route`]'s lookup, catching
    /// panics and handler-returned errors alike and folding both into
    /// [`VoiceChatError::HandlerException`].
    fn invoke(
        &self,
        event_type: &str,
        raw: &[u8],
        decoded: &DecodedEnvelope<'_>,
    ) -> Result<(), VoiceChatError> {
        if event_type.ends_with(".error") {
            let base = event_type.strip_suffix(".error").unwrap();
            if let Some(result) = self.call(&self.primary, event_type, raw, decoded) {
                return result;
            }
            if let Some(result) = self.call(&self.error, base, raw, decoded) {
                return result;
            }
            if let Some(result) = self.call(&self.primary, "error", raw, decoded) {
                return result;
            }
            return Err(VoiceChatError::UnhandledEvent(event_type.to_owned()));
        }

        self.call(&self.primary, event_type, raw, decoded)
            .unwrap_or_else(|| Err(VoiceChatError::UnhandledEvent(event_type.to_owned())))
    }

    fn call(
        &self,
        map: &RwLock<HashMap<String, Handler>>,
        key: &str,
        raw: &[u8],
        decoded: &DecodedEnvelope<'_>,
    ) -> Option<Result<(), VoiceChatError>> {
        let guard = map.read().unwrap();
        let handler = guard.get(key)?;
        let result = catch_unwind(AssertUnwindSafe(|| handler(raw, decoded)))
            .unwrap_or_else(|_| Err(VoiceChatError::HandlerException(format!("{key} panicked"))));
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EventId;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn decoded(event_type: &str) -> DecodedEnvelope<'static> {
        DecodedEnvelope {
            event_type: event_type.to_owned(),
            event_id: EventId::new(),
            session_id: None,
            payload: json!({}),
            audio: None,
        }
    }

    #[test]
    fn routes_exact_match() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.register(
            "voicechat.response.chunk",
            Box::new(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let d = decoded("voicechat.response.chunk");
        assert!(registry.route(&[], "voicechat.response.chunk", &d));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unhandled_event_returns_false() {
        let registry = HandlerRegistry::new();
        let d = decoded("voicechat.response.chunk");
        assert!(!registry.route(&[], "voicechat.response.chunk", &d));
    }

    #[test]
    fn error_suffix_falls_back_through_chain() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        // No primary "audio.error" handler, no error-registry "audio"
        // handler — falls through to the primary wildcard "error".
        let h = Arc::clone(&hits);
        registry.register(
            "error",
            Box::new(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let d = decoded("audio.error");
        assert!(registry.route(&[], "audio.error", &d));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_registry_beats_wildcard() {
        let registry = HandlerRegistry::new();
        let via_error_registry = Arc::new(AtomicUsize::new(0));
        let via_wildcard = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&via_error_registry);
        registry.register_error(
            "audio",
            Box::new(move |_, _| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let b = Arc::clone(&via_wildcard);
        registry.register(
            "error",
            Box::new(move |_, _| {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let d = decoded("audio.error");
        assert!(registry.route(&[], "audio.error", &d));
        assert_eq!(via_error_registry.load(Ordering::SeqCst), 1);
        assert_eq!(via_wildcard.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_replacement_only_runs_latest() {
        let registry = HandlerRegistry::new();
        let h1_hits = Arc::new(AtomicUsize::new(0));
        let h2_hits = Arc::new(AtomicUsize::new(0));

        let h1 = Arc::clone(&h1_hits);
        registry.register(
            "voicechat.response.chunk",
            Box::new(move |_, _| {
                h1.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let h2 = Arc::clone(&h2_hits);
        registry.register(
            "voicechat.response.chunk",
            Box::new(move |_, _| {
                h2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let d = decoded("voicechat.response.chunk");
        assert!(registry.route(&[], "voicechat.response.chunk", &d));
        assert_eq!(h1_hits.load(Ordering::SeqCst), 0);
        assert_eq!(h2_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_error_is_reported_as_handled() {
        let registry = HandlerRegistry::new();
        registry.register(
            "voicechat.response.chunk",
            Box::new(|_, _| Err(VoiceChatError::InvalidAudioPayload("bad".into()))),
        );
        let d = decoded("voicechat.response.chunk");
        assert!(registry.route(&[], "voicechat.response.chunk", &d));
    }
}
