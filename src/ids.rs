//! Time-ordered identifiers.
//!
//! `event_id` and `utterance_id` both rely on the property that
//! lexicographic order equals chronological order. [`ulid::Ulid`] satisfies
//! this (48-bit millisecond timestamp followed by monotonic randomness) and
//! its canonical string encoding preserves the ordering, so we use it for
//! both identifier kinds rather than inventing a bespoke scheme.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A freshly minted, time-ordered identifier for an outbound event.
///
/// Invariant: every outbound message carries a freshly minted `EventId`; the
/// recipient echoes it back in acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// Mint a new, chronologically-ordered event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_str(s)?))
    }
}

/// Identifies one server-side response delivered as an ordered sequence of
/// PCM chunks. Lexicographic order equals arrival order, which lets the
/// playback sequencer detect "a newer utterance has begun" by comparison
/// alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtteranceId(Ulid);

impl UtteranceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UtteranceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UtteranceId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn event_ids_sort_chronologically() {
        let a = EventId::new();
        sleep(Duration::from_millis(2));
        let b = EventId::new();
        assert!(a.to_string() < b.to_string());
        assert!(a < b);
    }

    #[test]
    fn round_trips_through_string() {
        let id = UtteranceId::new();
        let parsed: UtteranceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
