//! Clocked audio output over CPAL.
//!
//! The playback scheduler needs a sink with a monotonic audio clock and
//! sample-accurate scheduled starts — the device callback advances a sample
//! counter and a small mixer sums whichever scheduled buffers overlap the
//! rendered block, applying each submission's linear gain envelope. The
//! stream itself lives on a dedicated thread (CPAL streams are not `Send`
//! everywhere) and is dropped when the sink is released.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capture::ReleaseGuard;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{OutputSink, ScheduledBuffer};

/// How long to wait for the output thread to report stream startup.
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Output sink configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Sample rate in Hz (default 24000, matching the wire format).
    pub sample_rate: u32,
    /// Master gain applied after mixing, slightly below unity to avoid
    /// clipping when crossfaded chunks overlap (default 0.8).
    pub master_gain: f32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            master_gain: 0.8,
        }
    }
}

/// A submission resolved onto the sample clock.
struct ActiveBuffer {
    samples: Vec<f32>,
    start_sample: u64,
    fade_in_samples: u64,
    fade_out_samples: u64,
}

impl ActiveBuffer {
    fn end_sample(&self) -> u64 {
        self.start_sample + self.samples.len() as u64
    }

    /// Envelope gain for the sample at `offset` into the buffer.
    fn gain_at(&self, offset: u64) -> f32 {
        let len = self.samples.len() as u64;
        let mut gain = 1.0f32;
        if self.fade_in_samples > 0 && offset < self.fade_in_samples {
            gain *= offset as f32 / self.fade_in_samples as f32;
        }
        if self.fade_out_samples > 0 && offset + self.fade_out_samples >= len {
            let remaining = len - offset;
            gain *= remaining as f32 / self.fade_out_samples as f32;
        }
        gain
    }
}

/// Mixer state shared between the device callback and submissions.
pub(crate) struct MixerState {
    clock_samples: u64,
    scheduled: Vec<ActiveBuffer>,
    sample_rate: u32,
    master_gain: f32,
}

impl MixerState {
    fn new(config: &SinkConfig) -> Self {
        Self {
            clock_samples: 0,
            scheduled: Vec::new(),
            sample_rate: config.sample_rate,
            master_gain: config.master_gain,
        }
    }

    fn now(&self) -> f64 {
        self.clock_samples as f64 / self.sample_rate as f64
    }

    fn submit(&mut self, buffer: ScheduledBuffer) {
        if buffer.samples.is_empty() {
            return;
        }
        let rate = self.sample_rate as f64;
        // A start already in the past plays immediately; the clock never
        // rewinds.
        let requested = (buffer.start_time * rate).round() as i64;
        let start_sample = (requested.max(0) as u64).max(self.clock_samples);

        let fade_in_samples = (buffer.fade_in * rate).round() as u64;
        let fade_out_samples = (buffer.fade_out * rate).round() as u64;

        self.scheduled.push(ActiveBuffer {
            samples: buffer.samples,
            start_sample,
            fade_in_samples,
            fade_out_samples,
        });
    }

    /// Render one output block: sum overlapping buffers with their
    /// envelopes, apply master gain, advance the clock, drop spent buffers.
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        let block_start = self.clock_samples;

        for (i, slot) in out.iter_mut().enumerate() {
            let t = block_start + i as u64;
            let mut mixed = 0.0f32;
            for buffer in &self.scheduled {
                if t >= buffer.start_sample && t < buffer.end_sample() {
                    let offset = t - buffer.start_sample;
                    mixed += buffer.samples[offset as usize] * buffer.gain_at(offset);
                }
            }
            *slot = (mixed * self.master_gain).clamp(-1.0, 1.0);
        }

        self.clock_samples = block_start + out.len() as u64;
        let clock = self.clock_samples;
        self.scheduled.retain(|b| b.end_sample() > clock);
    }

    fn clear(&mut self) {
        self.scheduled.clear();
    }
}

/// The device-backed output sink. Owns the output stream exclusively for
/// its lifetime; dropping it releases the device on every exit path.
pub struct AudioOutput {
    mixer: Arc<Mutex<MixerState>>,
    release: Mutex<ReleaseGuard>,
}

impl AudioOutput {
    /// Open the default output device and start the render stream.
    pub fn open(config: SinkConfig) -> VoiceResult<Arc<Self>> {
        let mixer = Arc::new(Mutex::new(MixerState::new(&config)));
        let sample_rate = config.sample_rate;

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let callback_mixer = Arc::clone(&mixer);
        let thread = thread::spawn(move || {
            let stream = match build_output_stream(&config, callback_mixer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let _ = stop_rx.recv();
            drop(stream);
            debug!("output stream released");
        });

        match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(VoiceError::Device(
                    "timed out waiting for output stream startup".to_string(),
                ))
            }
        }

        info!(sample_rate, "audio output ready");

        let release = Mutex::new(ReleaseGuard::new(move || {
            let _ = stop_tx.send(());
            let _ = thread.join();
        }));

        Ok(Arc::new(Self { mixer, release }))
    }

    /// Drop any scheduled audio immediately (stop/interruption path).
    pub fn clear(&self) {
        self.mixer.lock().clear();
    }

    /// Release the output device. Also runs on drop.
    pub fn close(&self) {
        self.release.lock().release();
    }
}

impl OutputSink for AudioOutput {
    fn now(&self) -> f64 {
        self.mixer.lock().now()
    }

    fn submit(&self, buffer: ScheduledBuffer) {
        self.mixer.lock().submit(buffer);
    }
}

fn build_output_stream(
    config: &SinkConfig,
    mixer: Arc<Mutex<MixerState>>,
) -> VoiceResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::Device("no output device available".to_string()))?;

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            mixer.lock().render(data);
        },
        move |err| {
            warn!("output stream error: {err}");
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> MixerState {
        MixerState::new(&SinkConfig {
            sample_rate: 1000,
            master_gain: 1.0,
        })
    }

    fn scheduled(samples: Vec<f32>, start_time: f64, fade: f64) -> ScheduledBuffer {
        ScheduledBuffer {
            samples,
            sample_rate: 1000,
            start_time,
            fade_in: fade,
            fade_out: fade,
        }
    }

    #[test]
    fn clock_advances_with_rendered_blocks() {
        let mut mixer = state();
        let mut block = vec![0.0f32; 250];
        mixer.render(&mut block);
        assert_eq!(mixer.now(), 0.25);
        mixer.render(&mut block);
        assert_eq!(mixer.now(), 0.5);
    }

    #[test]
    fn silence_without_submissions() {
        let mut mixer = state();
        let mut block = vec![1.0f32; 64];
        mixer.render(&mut block);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn buffer_plays_at_its_scheduled_start() {
        let mut mixer = state();
        // 10 samples of 0.5 starting at t = 0.016 (sample 16).
        mixer.submit(scheduled(vec![0.5; 10], 0.016, 0.0));

        let mut block = vec![0.0f32; 32];
        mixer.render(&mut block);

        assert!(block[..16].iter().all(|&s| s == 0.0));
        assert!(block[16..26].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(block[26..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn past_start_times_play_immediately() {
        let mut mixer = state();
        let mut block = vec![0.0f32; 100];
        mixer.render(&mut block); // clock at sample 100

        mixer.submit(scheduled(vec![0.5; 10], 0.05, 0.0)); // sample 50, in the past

        let mut block = vec![0.0f32; 20];
        mixer.render(&mut block);
        assert!((block[0] - 0.5).abs() < 1e-6, "must start at current clock");
    }

    #[test]
    fn gain_envelope_ramps_edges() {
        let mut mixer = state();
        // 100 samples, 10-sample fades on both edges.
        mixer.submit(scheduled(vec![1.0; 100], 0.0, 0.01));

        let mut block = vec![0.0f32; 100];
        mixer.render(&mut block);

        assert_eq!(block[0], 0.0);
        assert!(block[5] > 0.0 && block[5] < 1.0);
        assert!((block[50] - 1.0).abs() < 1e-6);
        assert!(block[99] > 0.0 && block[99] < block[50]);
        // Monotone rise across the fade-in.
        assert!(block[1] < block[9]);
    }

    #[test]
    fn overlapping_crossfaded_buffers_sum_near_unity() {
        let mut mixer = state();
        // Two unit buffers overlapping by 10 samples, both with 10-sample
        // ramps: in the overlap, fade-out of A plus fade-in of B ≈ 1.
        mixer.submit(scheduled(vec![1.0; 50], 0.0, 0.01));
        mixer.submit(scheduled(vec![1.0; 50], 0.04, 0.01));

        let mut block = vec![0.0f32; 90];
        mixer.render(&mut block);

        for (i, &s) in block[41..49].iter().enumerate() {
            assert!(
                (s - 1.0).abs() < 0.11,
                "crossfade sum at overlap sample {i} drifted: {s}"
            );
        }
    }

    #[test]
    fn master_gain_and_clipping_are_applied() {
        let mut mixer = MixerState::new(&SinkConfig {
            sample_rate: 1000,
            master_gain: 0.8,
        });
        mixer.submit(scheduled(vec![1.0; 4], 0.0, 0.0));
        mixer.submit(scheduled(vec![1.0; 4], 0.0, 0.0));

        let mut block = vec![0.0f32; 4];
        mixer.render(&mut block);
        // 2.0 mixed * 0.8 = 1.6, clamped to 1.0.
        assert!(block.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn spent_buffers_are_dropped() {
        let mut mixer = state();
        mixer.submit(scheduled(vec![0.5; 10], 0.0, 0.0));

        let mut block = vec![0.0f32; 50];
        mixer.render(&mut block);
        assert!(mixer.scheduled.is_empty());
    }

    #[test]
    fn clear_drops_pending_audio() {
        let mut mixer = state();
        mixer.submit(scheduled(vec![0.5; 10], 1.0, 0.0));
        mixer.clear();

        let mut block = vec![0.0f32; 50];
        mixer.render(&mut block);
        assert!(block.iter().all(|&s| s == 0.0));
    }
}
