//! **Voice Activity Detector** — hysteresis over frequency-magnitude frames.
//!
//! Driven at the control-loop rate (~60 Hz) with the mean byte magnitude
//! from [`crate::spectrum::SpectrumAnalyzer`]. Classification flips only on
//! runs of consecutive frames, never on a single frame, so transient spikes
//! cannot cancel silence detection and brief dropouts cannot end a turn:
//!
//! ```text
//! [Silence] ── ≥6 consecutive voice frames ──► [Voice]   (SpeechStarted)
//! [Voice]   ── ≥45 consecutive silent frames ─► [Silence] (SustainedSilence,
//!                                                          arms 700ms confirm)
//! [Silence] ── confirm deadline passes, still silent ──► TurnReady
//! [Silence] ── voice re-confirmed before deadline ─────► cancels submission
//! ```
//!
//! While assistant audio is playing, frames are still pumped but
//! classification is skipped so the engine does not hear its own output.
//! This is deliberate self-trigger avoidance, not echo cancellation.

use std::time::{Duration, Instant};

use tracing::debug;

/// Configuration for voice activity detection.
///
/// Defaults are the empirically tuned values from the production control
/// loop; treat them as a matched set.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Mean byte magnitude (0..255 scale) above which a frame counts as voice.
    pub voice_threshold: f32,
    /// Consecutive voice frames required for Silence → Voice (~0.1s at 60Hz).
    pub voice_frames: u32,
    /// Consecutive silent frames required for Voice → Silence (~0.75s at 60Hz).
    pub silence_frames: u32,
    /// Confirmation delay after sustained silence before a turn is submitted.
    pub confirm_delay: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            voice_threshold: 20.0,
            voice_frames: 6,
            silence_frames: 45,
            confirm_delay: Duration::from_millis(700),
        }
    }
}

/// Edge-triggered events raised by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Confirmed transition into voice.
    SpeechStarted,
    /// Confirmed transition into silence; the confirmation delay is armed.
    SustainedSilence,
    /// Silence held through the confirmation delay — submit the turn.
    TurnReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Voice,
    Silence,
}

/// Frame-count hysteresis state machine over the live magnitude signal.
pub struct VadDetector {
    config: VadConfig,
    phase: Phase,
    consecutive_voice_frames: u32,
    consecutive_silent_frames: u32,
    /// Voice was confirmed at least once since the last reset; idle-mic
    /// silence never produces a submission.
    has_spoken: bool,
    silence_started_at: Option<Instant>,
    confirm_deadline: Option<Instant>,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            phase: Phase::Silence,
            consecutive_voice_frames: 0,
            consecutive_silent_frames: 0,
            has_spoken: false,
            silence_started_at: None,
            confirm_deadline: None,
        }
    }

    /// Feed one frame. `playback_active` suspends classification while the
    /// assistant's own audio is audible. The clock is injected so the
    /// hysteresis and confirmation window are testable without sleeping.
    pub fn poll(
        &mut self,
        mean_magnitude: f32,
        playback_active: bool,
        now: Instant,
    ) -> Option<VadEvent> {
        if playback_active {
            return None;
        }

        if mean_magnitude > self.config.voice_threshold {
            self.on_voice_frame()
        } else {
            self.on_silent_frame(now)
        }
    }

    fn on_voice_frame(&mut self) -> Option<VadEvent> {
        self.consecutive_voice_frames += 1;
        self.consecutive_silent_frames = 0;

        if self.phase == Phase::Silence
            && self.consecutive_voice_frames >= self.config.voice_frames
        {
            self.phase = Phase::Voice;
            self.has_spoken = true;
            self.silence_started_at = None;
            if self.confirm_deadline.take().is_some() {
                debug!("voice resumed, cancelling pending turn submission");
            }
            debug!("speech started");
            return Some(VadEvent::SpeechStarted);
        }

        None
    }

    fn on_silent_frame(&mut self, now: Instant) -> Option<VadEvent> {
        self.consecutive_silent_frames += 1;
        self.consecutive_voice_frames = 0;

        if self.phase == Phase::Voice
            && self.consecutive_silent_frames >= self.config.silence_frames
        {
            self.phase = Phase::Silence;
            self.silence_started_at = Some(now);
            self.confirm_deadline = Some(now + self.config.confirm_delay);
            debug!("sustained silence, arming turn confirmation");
            return Some(VadEvent::SustainedSilence);
        }

        if self.phase == Phase::Silence && self.has_spoken {
            if let Some(deadline) = self.confirm_deadline {
                if now >= deadline {
                    self.confirm_deadline = None;
                    self.has_spoken = false;
                    debug!("silence confirmed, turn ready for submission");
                    return Some(VadEvent::TurnReady);
                }
            }
        }

        None
    }

    /// Whether the detector currently classifies the signal as silent.
    pub fn is_silent(&self) -> bool {
        self.phase == Phase::Silence
    }

    /// When the current sustained-silence period began, if any.
    pub fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }

    /// Cancel any pending confirmation and return to the initial state.
    /// Called when a turn is committed or the call stops.
    pub fn reset(&mut self) {
        self.phase = Phase::Silence;
        self.consecutive_voice_frames = 0;
        self.consecutive_silent_frames = 0;
        self.has_spoken = false;
        self.silence_started_at = None;
        self.confirm_deadline = None;
    }
}

impl Default for VadDetector {
    fn default() -> Self {
        Self::new(VadConfig::default())
    }
}
