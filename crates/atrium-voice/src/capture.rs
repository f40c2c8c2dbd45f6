//! **Capture Pipeline** — microphone frames to on-wire audio chunks.
//!
//! Pulls fixed-size frames from the input device via CPAL, accumulates them
//! until a minimum on-wire chunk duration is reached, encodes the merged
//! buffer as PCM16/base64 and emits Append wire frames. Accumulation bounds
//! both per-frame protocol overhead and added latency.
//!
//! The device stream is owned by a dedicated thread (CPAL streams are not
//! `Send` on every platform); the thread parks on a stop channel and drops
//! the stream when the handle is stopped or dropped, so the microphone is
//! released on every exit path.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{self, WireFrame};
use crate::error::{VoiceError, VoiceResult};

/// How many recent samples the analyzer ring keeps for the 60Hz VAD poll.
const ANALYZER_RING_SAMPLES: usize = 2048;

/// How long to wait for the capture thread to report stream startup.
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Audio capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default 24000, the wire format rate).
    pub sample_rate: u32,
    /// Number of channels (default 1, mono).
    pub channels: u16,
    /// Device frame size in samples (default 4096).
    pub frame_size: usize,
    /// Minimum accumulated duration before a wire chunk is emitted (default 200ms).
    pub min_chunk_ms: u64,
    /// Minimum partial accumulation worth flushing on stop (default 50ms);
    /// anything shorter is discarded silently.
    pub min_flush_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            frame_size: 4096,
            min_chunk_ms: 200,
            min_flush_ms: 50,
        }
    }
}

/// An enumerable input device.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
}

/// List available input devices.
pub fn list_devices() -> VoiceResult<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let devices = host.input_devices()?;

    let mut out = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            out.push(AudioDevice {
                id: name.clone(),
                label: name,
            });
        }
    }
    Ok(out)
}

/// Merges device frames until the accumulated duration crosses the wire
/// chunk threshold. Pure state, no I/O — the device callback drives it.
pub struct FrameAccumulator {
    frames: Vec<Vec<f32>>,
    accumulated_samples: usize,
    min_chunk_samples: usize,
    min_flush_samples: usize,
}

impl FrameAccumulator {
    pub fn new(config: &CaptureConfig) -> Self {
        let per_ms = config.sample_rate as usize / 1000;
        Self {
            frames: Vec::new(),
            accumulated_samples: 0,
            min_chunk_samples: config.min_chunk_ms as usize * per_ms,
            min_flush_samples: config.min_flush_ms as usize * per_ms,
        }
    }

    /// Add one device frame. Returns the merged buffer when the accumulated
    /// duration has crossed the chunk threshold, resetting the accumulator.
    pub fn push(&mut self, frame: Vec<f32>) -> Option<Vec<f32>> {
        self.accumulated_samples += frame.len();
        self.frames.push(frame);

        if self.accumulated_samples >= self.min_chunk_samples {
            return Some(self.drain());
        }
        None
    }

    /// Flush a partial accumulation at stop time. Sub-threshold remnants
    /// below the minimal-utility size are discarded.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        if self.accumulated_samples >= self.min_flush_samples {
            return Some(self.drain());
        }
        if self.accumulated_samples > 0 {
            debug!(
                samples = self.accumulated_samples,
                "discarding sub-threshold capture remnant"
            );
            self.frames.clear();
            self.accumulated_samples = 0;
        }
        None
    }

    fn drain(&mut self) -> Vec<f32> {
        let mut merged = Vec::with_capacity(self.accumulated_samples);
        for frame in self.frames.drain(..) {
            merged.extend_from_slice(&frame);
        }
        self.accumulated_samples = 0;
        merged
    }
}

/// Runs a closure exactly once when the owning resource is released,
/// whether through an explicit `stop` or a drop on an error path.
pub(crate) struct ReleaseGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ReleaseGuard {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub(crate) fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// The capture pipeline. `start` claims the device exclusively until the
/// returned handle is stopped or dropped.
pub struct CapturePipeline {
    config: CaptureConfig,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Open the selected (or default) input device and start streaming
    /// merged wire frames. The handle owns the device for its lifetime.
    pub fn start(&self, device_id: Option<&str>) -> VoiceResult<CaptureHandle> {
        let config = self.config.clone();
        let sample_rate = config.sample_rate;
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(ANALYZER_RING_SAMPLES)));
        let accumulator = Arc::new(Mutex::new(FrameAccumulator::new(&config)));

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let callback_ring = Arc::clone(&recent);
        let callback_accumulator = Arc::clone(&accumulator);
        let callback_tx = frame_tx.clone();
        let requested_device = device_id.map(str::to_owned);

        let thread = thread::spawn(move || {
            let stream = match build_input_stream(
                &config,
                requested_device.as_deref(),
                callback_ring,
                callback_accumulator,
                callback_tx,
            ) {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Park until stop is requested (or the handle is dropped and the
            // sender disappears), then release the device by dropping the
            // stream.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("capture stream released");
        });

        let device_name = match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(VoiceError::Device(
                    "timed out waiting for capture stream startup".to_string(),
                ))
            }
        };

        info!(device = %device_name, sample_rate, "capture started");

        let release = ReleaseGuard::new(move || {
            let _ = stop_tx.send(());
            let _ = thread.join();
        });

        Ok(CaptureHandle {
            frame_rx: Some(frame_rx),
            frame_tx,
            recent,
            accumulator,
            release,
        })
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    device_id: Option<&str>,
    ring: Arc<Mutex<VecDeque<f32>>>,
    accumulator: Arc<Mutex<FrameAccumulator>>,
    frame_tx: mpsc::UnboundedSender<WireFrame>,
) -> VoiceResult<(cpal::Stream, String)> {
    let host = cpal::default_host();

    let device = match device_id {
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| VoiceError::Device(format!("input device not found: {wanted}")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::Device("no input device available".to_string()))?,
    };
    let name = device.name()?;

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_size = config.frame_size;
    let mut frame_buffer: Vec<f32> = Vec::with_capacity(frame_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                frame_buffer.push(sample);
                if frame_buffer.len() >= frame_size {
                    let frame = std::mem::replace(
                        &mut frame_buffer,
                        Vec::with_capacity(frame_size),
                    );

                    {
                        let mut ring = ring.lock();
                        ring.extend(frame.iter().copied());
                        while ring.len() > ANALYZER_RING_SAMPLES {
                            ring.pop_front();
                        }
                    }

                    if let Some(merged) = accumulator.lock().push(frame) {
                        let wire = WireFrame::append(codec::encode(&merged));
                        if frame_tx.send(wire).is_err() {
                            warn!("wire frame receiver dropped, discarding capture chunk");
                        }
                    }
                }
            }
        },
        move |err| {
            warn!("capture stream error: {err}");
        },
        None,
    )?;

    stream.play()?;

    Ok((stream, name))
}

/// Live capture session. Owns the device exclusively; release is guaranteed
/// on stop and on drop, including error unwinds.
pub struct CaptureHandle {
    frame_rx: Option<mpsc::UnboundedReceiver<WireFrame>>,
    frame_tx: mpsc::UnboundedSender<WireFrame>,
    recent: Arc<Mutex<VecDeque<f32>>>,
    accumulator: Arc<Mutex<FrameAccumulator>>,
    release: ReleaseGuard,
}

impl CaptureHandle {
    /// Take the merged wire-frame stream (single consumer).
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<WireFrame>> {
        self.frame_rx.take()
    }

    /// Snapshot of the most recent captured samples for the spectrum
    /// analyzer (newest `n`, oldest first).
    pub fn latest_samples(&self, n: usize) -> Vec<f32> {
        let ring = self.recent.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).copied().collect()
    }

    /// Stop capture: release the device, then flush any partial
    /// accumulation that exceeds the minimal-utility size.
    pub fn stop(mut self) {
        self.release.release();

        if let Some(remnant) = self.accumulator.lock().flush() {
            debug!(samples = remnant.len(), "flushing partial capture chunk");
            let _ = self.frame_tx.send(WireFrame::append(codec::encode(&remnant)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frames_of(n: usize, count: usize) -> Vec<Vec<f32>> {
        (0..count).map(|_| vec![0.1f32; n]).collect()
    }

    #[test]
    fn accumulator_holds_until_threshold() {
        let config = CaptureConfig::default();
        let mut acc = FrameAccumulator::new(&config);

        // 4096 samples at 24kHz is ~170ms, below the 200ms threshold.
        assert!(acc.push(vec![0.0; 4096]).is_none());
        // The second frame crosses the threshold: one merged emission.
        let merged = acc.push(vec![0.0; 4096]).expect("threshold crossed");
        assert_eq!(merged.len(), 8192);
    }

    #[test]
    fn five_frames_with_long_chunk_threshold_emit_one_merged_frame() {
        // Raise the chunk threshold so five device frames fit in a single
        // wire chunk, then verify the single merged emission and its
        // encoded payload size.
        let config = CaptureConfig {
            min_chunk_ms: 800,
            ..CaptureConfig::default()
        };
        let mut acc = FrameAccumulator::new(&config);

        let mut emissions = Vec::new();
        for frame in frames_of(4096, 5) {
            if let Some(merged) = acc.push(frame) {
                emissions.push(merged);
            }
        }

        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].len(), 4096 * 5);

        let payload = crate::codec::encode(&emissions[0]);
        let bytes = {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            STANDARD.decode(payload).unwrap()
        };
        assert_eq!(bytes.len(), 4096 * 5 * 2);
    }

    #[test]
    fn flush_discards_sub_threshold_remnants() {
        let config = CaptureConfig::default();
        let mut acc = FrameAccumulator::new(&config);

        // 1000 samples ≈ 42ms, below the 50ms minimal-utility size.
        acc.push(vec![0.0; 1000]);
        assert!(acc.flush().is_none());
        // And the remnant is actually gone.
        assert!(acc.flush().is_none());
    }

    #[test]
    fn flush_emits_useful_partials() {
        let config = CaptureConfig::default();
        let mut acc = FrameAccumulator::new(&config);

        acc.push(vec![0.0; 4096]);
        let flushed = acc.flush().expect("170ms partial is useful");
        assert_eq!(flushed.len(), 4096);
    }

    #[test]
    fn release_guard_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));

        let mut guard = ReleaseGuard::new({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        guard.release();
        guard.release();
        drop(guard);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_guard_fires_on_drop_during_unwind() {
        let count = Arc::new(AtomicUsize::new(0));

        let result = std::panic::catch_unwind({
            let count = Arc::clone(&count);
            move || {
                let _guard = ReleaseGuard::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
                panic!("simulated device error mid-capture");
            }
        });

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
