//! **Playback Scheduler** — gapless, crossfaded output of streamed audio.
//!
//! Decoded response chunks arrive asynchronously and are queued FIFO. The
//! scheduler holds playback until a minimum buffered duration is reached
//! (a deliberate latency/robustness trade-off against startup underrun),
//! then schedules each chunk against the sink's monotonic audio clock with
//! a short crossfade overlapping adjacent chunks so independently
//! synthesized segments play as one continuous stream. The next chunk is
//! scheduled slightly before the current one ends rather than waiting for
//! an end callback, tolerating timer jitter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Playback scheduling configuration.
///
/// The thresholds are empirically tuned in the production engine; they are
/// configuration, not derived values.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Minimum total queued duration before playback starts (default 0.2s).
    pub buffer_threshold: f64,
    /// Crossfade window between adjacent chunks (default 15ms).
    pub crossfade: f64,
    /// Safety margin added to the clock on the first chunk after idle
    /// (default 0.1s).
    pub start_margin: f64,
    /// Fraction of the remaining time after which the next chunk is
    /// scheduled (default 0.95).
    pub tick_fraction: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 0.2,
            crossfade: 0.015,
            start_margin: 0.1,
            tick_fraction: 0.95,
        }
    }
}

/// A decoded audio chunk owned by exactly one pipeline stage at a time.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A buffer submission against the sink clock, with its gain envelope.
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Start time in seconds on the sink's monotonic clock.
    pub start_time: f64,
    /// Linear gain ramp 0→1 over this many seconds at the start (0 = none).
    pub fade_in: f64,
    /// Linear gain ramp 1→0 over this many seconds at the end (0 = none).
    pub fade_out: f64,
}

impl ScheduledBuffer {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// The clocked audio output sink: sample-accurate scheduled submission with
/// per-submission gain envelopes. Implemented by the device mixer and by
/// spies in tests.
pub trait OutputSink: Send + Sync {
    /// Current time on the sink's monotonic audio clock, in seconds.
    fn now(&self) -> f64;
    /// Submit a buffer for playback at its scheduled start time.
    fn submit(&self, buffer: ScheduledBuffer);
}

struct PlaybackState {
    queue: VecDeque<AudioBuffer>,
    next_play_time: f64,
    playing: bool,
    enabled: bool,
}

impl PlaybackState {
    fn queued_duration(&self) -> f64 {
        self.queue.iter().map(AudioBuffer::duration_seconds).sum()
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.playing = false;
        self.next_play_time = 0.0;
    }
}

/// FIFO jitter buffer + crossfade scheduler over an [`OutputSink`].
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    sink: Arc<dyn OutputSink>,
    state: Mutex<PlaybackState>,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, sink: Arc<dyn OutputSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            sink,
            state: Mutex::new(PlaybackState {
                queue: VecDeque::new(),
                next_play_time: 0.0,
                playing: false,
                enabled: true,
            }),
        })
    }

    /// Queue a decoded chunk and try to start playback. Chunks play
    /// strictly in enqueue order regardless of upstream decode timing.
    pub fn enqueue(self: &Arc<Self>, buffer: AudioBuffer) {
        {
            let mut state = self.state.lock();
            if !state.enabled {
                debug!("playback disabled, dropping chunk");
                return;
            }
            state.queue.push_back(buffer);
        }
        self.tick();
    }

    /// Attempt to start (or continue) playback. Below the buffering
    /// threshold this performs no sink submission — an underrun is a wait,
    /// not a failure.
    pub fn tick(self: &Arc<Self>) {
        {
            let state = self.state.lock();
            if state.playing {
                // The pump chain is already driving submissions.
                return;
            }
            if !state.enabled || state.queue.is_empty() {
                return;
            }
            let queued = state.queued_duration();
            if queued < self.config.buffer_threshold {
                debug!(queued_s = queued, "buffering before playback start");
                return;
            }
        }

        {
            let mut state = self.state.lock();
            if state.playing {
                return;
            }
            state.playing = true;
        }
        self.pump();
    }

    /// Schedule one chunk and arm the timer for the next. This is the
    /// "previous chunk nearly complete" path of the scheduler.
    fn pump(self: &Arc<Self>) {
        let delay = {
            let mut state = self.state.lock();

            if !state.enabled {
                state.reset();
                return;
            }

            let Some(buffer) = state.queue.pop_front() else {
                // Queue drained: reset so the next session starts against a
                // fresh clock origin instead of a stale one.
                state.playing = false;
                state.next_play_time = 0.0;
                return;
            };

            let now = self.sink.now();
            if state.next_play_time <= 0.0 {
                state.next_play_time = now + self.config.start_margin;
            }

            let start_time = now.max(state.next_play_time);
            let gap = start_time - now;
            let duration = buffer.duration_seconds();

            // Tight scheduling means this chunk abuts the previous one:
            // ramp the edges to mask the boundary discontinuity.
            let (fade_in, fade_out) = if gap < self.config.crossfade {
                (self.config.crossfade, self.config.crossfade)
            } else {
                (0.0, 0.0)
            };

            self.sink.submit(ScheduledBuffer {
                samples: buffer.samples,
                sample_rate: buffer.sample_rate,
                start_time,
                fade_in,
                fade_out,
            });

            // Overlap by the crossfade so adjacent ramps sum to unity.
            state.next_play_time = start_time + duration - self.config.crossfade;

            ((state.next_play_time - now) * self.config.tick_fraction).max(0.01)
        };

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            if scheduler.is_playing() {
                scheduler.pump();
            }
        });
    }

    /// Whether assistant audio is currently being scheduled/played. The
    /// VAD uses this for self-trigger avoidance.
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Total duration currently queued (seconds).
    pub fn queued_duration(&self) -> f64 {
        self.state.lock().queued_duration()
    }

    /// Enable or disable playback. Disabling mid-stream clears the queue
    /// and resets the clock origin.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let mut state = self.state.lock();
        state.enabled = enabled;
        if !enabled {
            state.reset();
        }
    }

    /// Drop all queued audio and reset scheduling state (call teardown).
    pub fn clear(&self) {
        self.state.lock().reset();
    }
}
