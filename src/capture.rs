//! Capture pipeline (C7) — microphone input as fixed-size PCM16LE frames.
//!
//! `cpal::Stream` is `!Send` on some platforms, so — same discipline as the
//! dedicated audio thread pattern — the stream is built and owned entirely
//! on its own OS thread; [`CapturePipeline`] is a `Send + Sync` handle that
//! only exchanges start/stop signals with it.
//!
//! This module is specified at the interface level: fixed framing, format,
//! and actual-rate negotiation are load-bearing; device enumeration and
//! platform echo-cancellation/noise-suppression/auto-gain negotiation are
//! best-effort, as cpal exposes no portable API for the latter three.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

use crate::config::CaptureConfig;
use crate::error::VoiceChatError;

/// A frame callback. Returns `false` to signal the consumer rejected the
/// frame (e.g. a full downstream queue); the pipeline logs and drops it
/// rather than blocking the real-time audio thread.
pub type FrameSink = dyn Fn(&[u8]) -> bool + Send + Sync;

struct RunningCapture {
    shutdown_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Owns the lifecycle of a microphone capture session.
#[derive(Default)]
pub struct CapturePipeline {
    running: Mutex<Option<RunningCapture>>,
}

impl CapturePipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start capturing. Returns the device's *actual* sample rate, which
    /// may differ from `config.requested_sample_rate`.
    pub fn start(
        &self,
        config: &CaptureConfig,
        on_frame: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Result<u32, VoiceChatError> {
        let mut guard = self.running.lock().unwrap();
        if guard.is_some() {
            return Err(VoiceChatError::AlreadyCapturing);
        }

        let (init_tx, init_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel();
        let buffer_samples = config.buffer_samples;
        let requested_rate = config.requested_sample_rate;

        let thread = thread::Builder::new()
            .name("voicechat-capture".into())
            .spawn(move || {
                run_capture_thread(requested_rate, buffer_samples, Box::new(on_frame), init_tx, shutdown_rx);
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn capture thread");
                VoiceChatError::NoDevice
            })?;

        let actual_rate = init_rx
            .recv()
            .map_err(|_| VoiceChatError::AudioThreadDied)??;

        *guard = Some(RunningCapture {
            shutdown_tx,
            thread,
        });
        Ok(actual_rate)
    }

    /// Stop capturing. Synchronous and idempotent: a no-op if not running.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(running) = running {
            let _ = running.shutdown_tx.send(());
            let _ = running.thread.join();
        }
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_thread(
    requested_rate: u32,
    buffer_samples: usize,
    on_frame: Box<FrameSink>,
    init_tx: std_mpsc::Sender<Result<u32, VoiceChatError>>,
    shutdown_rx: std_mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = init_tx.send(Err(VoiceChatError::NoDevice));
        return;
    };

    let supported_config = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to read default input config");
            let _ = init_tx.send(Err(VoiceChatError::NoDevice));
            return;
        }
    };

    let _ = requested_rate; // cpal exposes no rate-hint override on the default config path
    let actual_rate = supported_config.sample_rate().0;
    let channels = supported_config.channels();
    let sample_format = supported_config.sample_format();
    let stream_config: StreamConfig = supported_config.into();

    let accumulator: Mutex<Vec<f32>> = Mutex::new(Vec::with_capacity(buffer_samples * 2));
    let first_frame_logged = AtomicBool::new(false);
    let on_frame = Mutex::new(on_frame);

    let err_fn = |err: cpal::StreamError| {
        tracing::error!(%err, "capture stream error");
    };

    macro_rules! build_stream {
        ($ty:ty, $convert:expr) => {
            device.build_input_stream(
                &stream_config,
                move |data: &[$ty], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels, $convert);
                    emit_frames(&accumulator, &mono, buffer_samples, actual_rate, &first_frame_logged, &on_frame);
                },
                err_fn,
                None,
            )
        };
    }

    let stream = match sample_format {
        SampleFormat::F32 => build_stream!(f32, |s: f32| s),
        SampleFormat::I16 => build_stream!(i16, |s: i16| f32::from(s) / 32768.0),
        #[allow(clippy::cast_precision_loss)]
        SampleFormat::I32 => build_stream!(i32, |s: i32| s as f32 / 2_147_483_648.0),
        other => {
            tracing::error!(?other, "unsupported input sample format");
            let _ = init_tx.send(Err(VoiceChatError::NoDevice));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to build input stream");
            let _ = init_tx.send(Err(VoiceChatError::PermissionDenied));
            return;
        }
    };

    if let Err(e) = stream.play() {
        tracing::error!(error = %e, "failed to start input stream");
        let _ = init_tx.send(Err(VoiceChatError::PermissionDenied));
        return;
    }

    if init_tx.send(Ok(actual_rate)).is_err() {
        return;
    }

    let _ = shutdown_rx.recv();
    drop(stream);
    tracing::debug!("capture thread shutting down");
}

fn downmix<T: Copy>(data: &[T], channels: u16, convert: impl Fn(T) -> f32) -> Vec<f32> {
    let channels = channels as usize;
    if channels <= 1 {
        return data.iter().copied().map(convert).collect();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().copied().map(&convert).sum::<f32>() / channels as f32)
        .collect()
}

fn emit_frames(
    accumulator: &Mutex<Vec<f32>>,
    mono: &[f32],
    buffer_samples: usize,
    sample_rate: u32,
    first_frame_logged: &AtomicBool,
    on_frame: &Mutex<Box<FrameSink>>,
) {
    let mut buf = accumulator.lock().unwrap();
    buf.extend_from_slice(mono);

    while buf.len() >= buffer_samples {
        let frame: Vec<f32> = buf.drain(..buffer_samples).collect();

        if !first_frame_logged.swap(true, Ordering::SeqCst) {
            log_first_frame_diagnostic(&frame, sample_rate);
        }

        let bytes = pcm16le_bytes(&frame);
        let sink = on_frame.lock().unwrap();
        if !sink(&bytes) {
            tracing::warn!("capture consumer rejected frame; dropping");
        }
    }
}

fn log_first_frame_diagnostic(frame: &[f32], sample_rate: u32) {
    let sum_sq: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    #[allow(clippy::cast_precision_loss)]
    let rms = (sum_sq / frame.len() as f64).sqrt();
    let silent = rms < 1e-4;
    tracing::info!(sample_rate, rms, silent, "first capture frame");
}

/// Converts float samples in `[-1.0, 1.0]` to PCM16LE bytes, clamping
/// symmetrically before the final signed-16 clamp.
fn pcm16le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let scaled = clamped * 32768.0;
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        bytes.extend_from_slice(&sample_i16.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16le_clamps_out_of_range_samples() {
        let bytes = pcm16le_bytes(&[2.0, -2.0, 0.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), 0);
    }

    #[test]
    fn downmix_averages_interleaved_stereo() {
        let data = [1.0_f32, -1.0, 0.5, 0.5];
        let mono = downmix(&data, 2, |s| s);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn downmix_is_noop_for_mono_input() {
        let data = [0.1_f32, 0.2, 0.3];
        let mono = downmix(&data, 1, |s| s);
        assert_eq!(mono, data.to_vec());
    }

    #[test]
    fn emit_frames_drains_in_fixed_size_chunks() {
        let accumulator = Mutex::new(Vec::new());
        let first_frame_logged = AtomicBool::new(false);
        let emitted = std::sync::Arc::new(Mutex::new(Vec::new()));
        let e = std::sync::Arc::clone(&emitted);
        let on_frame: Mutex<Box<FrameSink>> = Mutex::new(Box::new(move |bytes: &[u8]| {
            e.lock().unwrap().push(bytes.len());
            true
        }));

        emit_frames(&accumulator, &vec![0.0; 10], 4, 16_000, &first_frame_logged, &on_frame);
        // 10 samples at frame size 4 -> two full frames, 2 samples left buffered.
        assert_eq!(*emitted.lock().unwrap(), vec![8, 8]);
        assert_eq!(accumulator.lock().unwrap().len(), 2);
    }

    #[test]
    fn already_capturing_is_rejected() {
        let pipeline = CapturePipeline::new();
        *pipeline.running.lock().unwrap() = Some(RunningCapture {
            shutdown_tx: std_mpsc::channel().0,
            thread: thread::spawn(|| {}),
        });
        let result = pipeline.start(&CaptureConfig::default(), |_| true);
        assert!(matches!(result, Err(VoiceChatError::AlreadyCapturing)));
    }
}
