//! Playback sequencer (C8) — time-ordered chunk queue with gap-free,
//! one-utterance-at-a-time scheduling.
//!
//! `rodio::OutputStream` is `!Send` on some platforms (same reason as
//! `cpal::Stream`, see [`crate::capture`]); it is confined to a dedicated
//! thread that does nothing but keep it alive. `rodio::Sink` and
//! `OutputStreamHandle` are ordinary `Send + Sync` handles and are used
//! directly from the scheduling task.
//!
//! The scheduling task appends each chunk to the utterance's sink
//! immediately (so rodio's own internal queue plays it back gap-free) and
//! then paces itself by sleeping the chunk's nominal duration before
//! considering the next one — matching the "await completion before
//! popping the next entry" ordering without blocking the runtime on a
//! platform audio callback.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rodio::{OutputStream, OutputStreamHandle, Sink};
use tokio::sync::Notify;

use crate::error::VoiceChatError;
use crate::ids::UtteranceId;

/// Sample rates above this are rejected as implausible rather than trusted
/// at face value from an untrusted wire payload.
pub(crate) const MAX_SAMPLE_RATE: u32 = 192_000;

struct QueuedChunk {
    utterance_id: UtteranceId,
    arrival_sequence: u64,
    bytes: Vec<u8>,
    sample_rate: u32,
}

struct SequencerState {
    queue: VecDeque<QueuedChunk>,
    active_utterance: Option<UtteranceId>,
    next_arrival_sequence: u64,
    task_running: bool,
    sink: Option<Sink>,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            active_utterance: None,
            next_arrival_sequence: 0,
            task_running: false,
            sink: None,
        }
    }
}

/// Owns the output context and the per-utterance chunk queue.
pub struct PlaybackSequencer {
    handle: OutputStreamHandle,
    stream_owner: Mutex<Option<StreamOwnerGuard>>,
    state: Arc<Mutex<SequencerState>>,
    stop_notify: Arc<Notify>,
}

impl PlaybackSequencer {
    pub fn new() -> Result<Self, VoiceChatError> {
        let (handle, guard) = spawn_output_stream()?;
        Ok(Self {
            handle,
            stream_owner: Mutex::new(Some(guard)),
            state: Arc::new(Mutex::new(SequencerState::default())),
            stop_notify: Arc::new(Notify::new()),
        })
    }

    /// Enqueue a PCM16LE chunk. If `utterance_id` differs from the active
    /// one, playback is stopped and the queue cleared before the chunk is
    /// adopted as the start of a new utterance.
    ///
    /// The chunk is copied immediately — it may alias a transport receive
    /// buffer the caller is not obliged to keep alive past this call.
    pub fn play_chunk(&self, audio_bytes: &[u8], sample_rate: u32, utterance_id: UtteranceId) {
        let owned = audio_bytes.to_vec();
        let mut state = self.state.lock().unwrap();

        if state.active_utterance != Some(utterance_id) {
            self.stop_locked(&mut state);
            state.active_utterance = Some(utterance_id);
        }

        let arrival_sequence = state.next_arrival_sequence;
        state.next_arrival_sequence += 1;
        state.queue.push_back(QueuedChunk {
            utterance_id,
            arrival_sequence,
            bytes: owned,
            sample_rate,
        });

        if !state.task_running {
            state.task_running = true;
            let state_handle = Arc::clone(&self.state);
            let output_handle = self.handle.clone();
            let stop_notify = Arc::clone(&self.stop_notify);
            tokio::spawn(run_queue(state_handle, output_handle, stop_notify));
        }
    }

    /// Cancel all in-flight audio, empty the queue, and clear the active
    /// utterance. Synchronous and idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut SequencerState) {
        state.queue.clear();
        state.active_utterance = None;
        if let Some(sink) = state.sink.take() {
            sink.stop();
        }
        self.stop_notify.notify_waiters();
    }

    /// Release the output context. The sequencer is unusable afterwards.
    pub fn destroy(&self) {
        self.stop();
        *self.stream_owner.lock().unwrap() = None;
    }

    #[must_use]
    pub fn active_utterance(&self) -> Option<UtteranceId> {
        self.state.lock().unwrap().active_utterance
    }

    /// Number of chunks still queued but not yet handed to a sink.
    /// Diagnostic/test use — confirms the scheduling task is actually
    /// draining new work rather than sitting idle on a stale run flag.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

async fn run_queue(state: Arc<Mutex<SequencerState>>, handle: OutputStreamHandle, stop_notify: Arc<Notify>) {
    loop {
        let Some(chunk) = next_chunk(&state) else {
            return;
        };

        match decode_and_validate(&chunk.bytes, chunk.sample_rate) {
            Ok(samples) => {
                if let Err(e) = play_one(&state, &handle, samples, chunk.sample_rate, &stop_notify) {
                    tracing::warn!(error = %e, "chunk playback failed; continuing with next");
                } else {
                    let duration = Duration::from_secs_f64(
                        (chunk_sample_count(&chunk) as f64 / f64::from(chunk.sample_rate)).max(0.0),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(duration) => {}
                        () = stop_notify.notified() => {}
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping invalid chunk");
            }
        }
    }
}

fn chunk_sample_count(chunk: &QueuedChunk) -> usize {
    chunk.bytes.len() / 2
}

/// Pop the next chunk whose utterance is still active, discarding any
/// chunks left over from a preempted utterance. Marks the task as no
/// longer running and returns `None` once the queue is exhausted — done
/// under the same lock acquisition as the emptiness check so a concurrent
/// `play_chunk` never observes a stale `task_running = true` with nothing
/// left to drain it.
fn next_chunk(state: &Arc<Mutex<SequencerState>>) -> Option<QueuedChunk> {
    let mut guard = state.lock().unwrap();
    loop {
        let Some(chunk) = guard.queue.pop_front() else {
            guard.task_running = false;
            return None;
        };
        if guard.active_utterance == Some(chunk.utterance_id) {
            return Some(chunk);
        }
        tracing::debug!("discarding chunk from a superseded utterance");
    }
}

impl Drop for PlaybackSequencer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play_one(
    state: &Arc<Mutex<SequencerState>>,
    handle: &OutputStreamHandle,
    samples: Vec<f32>,
    sample_rate: u32,
    _stop_notify: &Notify,
) -> Result<(), VoiceChatError> {
    let mut guard = state.lock().unwrap();
    if guard.sink.is_none() {
        let sink = Sink::try_new(handle).map_err(|e| {
            tracing::error!(error = %e, "failed to create playback sink");
            VoiceChatError::AudioContextSuspended
        })?;
        guard.sink = Some(sink);
    }
    let sink = guard.sink.as_ref().expect("just ensured present");
    let source = rodio::buffer::SamplesBuffer::new(1, sample_rate, samples);
    sink.append(source);
    Ok(())
}

/// Materialises a contiguous byte region, drops a trailing odd byte,
/// converts PCM16LE to float samples in `[-1.0, 1.0]`, and rejects invalid
/// input per the validation rules.
fn decode_and_validate(bytes: &[u8], sample_rate: u32) -> Result<Vec<f32>, VoiceChatError> {
    if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
        return Err(VoiceChatError::InvalidSampleRate(sample_rate));
    }

    let aligned = if bytes.len() % 2 != 0 {
        tracing::warn!("odd-length audio chunk; dropping trailing byte");
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };

    if aligned.is_empty() {
        return Err(VoiceChatError::InvalidAudioPayload("empty audio".into()));
    }

    let mut samples = Vec::with_capacity(aligned.len() / 2);
    for pair in aligned.chunks_exact(2) {
        let sample_i16 = i16::from_le_bytes([pair[0], pair[1]]);
        let sample = f32::from(sample_i16) / 32768.0;
        if !sample.is_finite() {
            return Err(VoiceChatError::InvalidAudioPayload(
                "non-finite sample".into(),
            ));
        }
        samples.push(sample);
    }

    Ok(samples)
}

struct StreamOwnerGuard {
    shutdown_tx: std_mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for StreamOwnerGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns the dedicated thread that owns the `!Send` `OutputStream` for as
/// long as the sequencer lives, and returns the `Send + Sync` handle used
/// to build sinks.
fn spawn_output_stream() -> Result<(OutputStreamHandle, StreamOwnerGuard), VoiceChatError> {
    let (init_tx, init_rx) = std_mpsc::channel();
    let (shutdown_tx, shutdown_rx) = std_mpsc::channel();

    let thread = thread::Builder::new()
        .name("voicechat-playback".into())
        .spawn(move || match OutputStream::try_default() {
            Ok((stream, handle)) => {
                if init_tx.send(Ok(handle)).is_err() {
                    return;
                }
                let _ = shutdown_rx.recv();
                drop(stream);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open default output device");
                let _ = init_tx.send(Err(VoiceChatError::AudioContextSuspended));
            }
        })
        .map_err(|_| VoiceChatError::AudioContextSuspended)?;

    let handle = init_rx
        .recv()
        .map_err(|_| VoiceChatError::AudioContextSuspended)??;

    Ok((
        handle,
        StreamOwnerGuard {
            shutdown_tx,
            thread: Some(thread),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let result = decode_and_validate(&[0, 0, 0, 0], 0);
        assert!(matches!(result, Err(VoiceChatError::InvalidSampleRate(0))));

        let result = decode_and_validate(&[0, 0], 200_000);
        assert!(matches!(result, Err(VoiceChatError::InvalidSampleRate(200_000))));
    }

    #[test]
    fn drops_trailing_odd_byte() {
        let samples = decode_and_validate(&[0, 0, 255, 127, 1], 16_000).unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn rejects_empty_audio() {
        let result = decode_and_validate(&[], 16_000);
        assert!(matches!(result, Err(VoiceChatError::InvalidAudioPayload(_))));

        // Single trailing byte with nothing else is also empty after alignment.
        let result = decode_and_validate(&[7], 16_000);
        assert!(matches!(result, Err(VoiceChatError::InvalidAudioPayload(_))));
    }

    #[test]
    fn decodes_known_pcm16_values() {
        let bytes = i16::MAX.to_le_bytes();
        let samples = decode_and_validate(&bytes, 16_000).unwrap();
        assert!((samples[0] - 0.999_969_5).abs() < 1e-6);
    }
}
