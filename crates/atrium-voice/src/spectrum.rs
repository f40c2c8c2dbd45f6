//! Frequency-magnitude analysis feeding the voice activity detector.
//!
//! Mirrors the Web Audio `AnalyserNode` contract the detector was tuned
//! against: a small real FFT over the most recent samples, per-bin
//! time-smoothing, then decibel magnitudes mapped onto a 0..255 byte scale
//! between a floor and ceiling. The VAD consumes the mean of those byte
//! magnitudes, so the 20.0 threshold keeps its original meaning.

use std::sync::Arc;

use realfft::num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};

/// Configuration for the spectrum analyzer.
#[derive(Debug, Clone)]
pub struct SpectrumConfig {
    /// FFT window size in samples (default 256, yielding 128 bins).
    pub fft_size: usize,
    /// Per-bin exponential time-smoothing constant (default 0.8).
    pub smoothing: f32,
    /// Decibel floor mapped to byte value 0 (default -100 dB).
    pub min_db: f32,
    /// Decibel ceiling mapped to byte value 255 (default -30 dB).
    pub max_db: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

/// Computes the mean byte-scaled frequency magnitude of an audio frame.
pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(config: SpectrumConfig) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.fft_size);

        // Hann window to tame spectral leakage on the short analysis frame.
        let n = config.fft_size;
        let window: Vec<f32> = (0..n)
            .map(|i| {
                let phase = std::f32::consts::PI * i as f32 / n as f32;
                phase.sin() * phase.sin()
            })
            .collect();

        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let smoothed = vec![0.0; n / 2];

        Self {
            config,
            fft,
            window,
            input,
            spectrum,
            smoothed,
        }
    }

    /// Analyze the most recent samples and return the mean byte magnitude
    /// (0..255) across the frequency bins.
    ///
    /// When fewer than `fft_size` samples are supplied the front of the
    /// window is zero-filled, matching an analyser polled faster than the
    /// capture callback delivers.
    pub fn mean_magnitude(&mut self, samples: &[f32]) -> f32 {
        let n = self.config.fft_size;

        self.input.iter_mut().for_each(|v| *v = 0.0);
        let take = samples.len().min(n);
        let src = &samples[samples.len() - take..];
        let dst_start = n - take;
        for (i, &s) in src.iter().enumerate() {
            self.input[dst_start + i] = s * self.window[dst_start + i];
        }

        if self.fft.process(&mut self.input, &mut self.spectrum).is_err() {
            // Scratch buffer sizes are fixed at construction, so this is
            // unreachable in practice; report silence rather than panic.
            return 0.0;
        }

        let tau = self.config.smoothing;
        let scale = 1.0 / n as f32;
        let (min_db, max_db) = (self.config.min_db, self.config.max_db);
        let mut sum = 0.0f32;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.spectrum[bin].norm() * scale;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
            sum += byte_magnitude(*smoothed, min_db, max_db);
        }

        sum / self.smoothed.len() as f32
    }

    /// Reset the time-smoothing state (new capture session).
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Map a linear magnitude onto the 0..255 byte scale between the decibel
/// floor and ceiling.
fn byte_magnitude(magnitude: f32, min_db: f32, max_db: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - min_db) / (max_db - min_db);
    scaled.clamp(0.0, 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic broadband signal (LCG noise), speech-like in the sense
    /// that energy spreads across all bins.
    fn noise(len: usize, amp: f32) -> Vec<f32> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let unit = (state >> 8) as f32 / (1u32 << 24) as f32;
                (unit * 2.0 - 1.0) * amp
            })
            .collect()
    }

    #[test]
    fn silence_yields_zero_magnitude() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        let mag = analyzer.mean_magnitude(&vec![0.0f32; 256]);
        assert_eq!(mag, 0.0);
    }

    #[test]
    fn loud_broadband_signal_rises_above_vad_threshold() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        let frame = noise(256, 0.8);

        // Feed repeatedly so the 0.8 time-smoothing converges.
        let mut mag = 0.0;
        for _ in 0..30 {
            mag = analyzer.mean_magnitude(&frame);
        }
        assert!(mag > 20.0, "loud broadband input should classify as voice: {mag}");
    }

    #[test]
    fn quiet_noise_floor_stays_below_threshold() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        let frame = noise(256, 0.0001);

        let mut mag = 0.0;
        for _ in 0..30 {
            mag = analyzer.mean_magnitude(&frame);
        }
        assert!(mag < 20.0, "near-silence should stay silent: {mag}");
    }

    #[test]
    fn short_frames_are_zero_padded() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        // Must not panic or misindex with fewer samples than fft_size.
        let mag = analyzer.mean_magnitude(&[0.1, -0.1, 0.1]);
        assert!(mag.is_finite());
    }

    #[test]
    fn reset_clears_smoothing_history() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        let frame = noise(256, 0.8);
        for _ in 0..30 {
            analyzer.mean_magnitude(&frame);
        }
        analyzer.reset();
        let mag = analyzer.mean_magnitude(&vec![0.0f32; 256]);
        assert_eq!(mag, 0.0);
    }
}
