//! **Sample Codec** — PCM16/base64 wire format ⇄ normalized f32 mono samples.
//!
//! The remote endpoint speaks 16-bit signed little-endian PCM framed in
//! base64. Decoding also conditions the signal: DC offset removal plus a
//! light one-pole low-pass to suppress quantization noise from the
//! synthesizer. A malformed frame yields a `Codec` error; callers skip the
//! frame and keep the stream alive.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{VoiceError, VoiceResult};

/// Smoothing factor for the decode-side one-pole low-pass filter.
pub const SMOOTHING_ALPHA: f32 = 0.05;

/// Frame kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    /// PCM16 audio appended to the remote input buffer.
    Append,
    /// Commit the accumulated input buffer as one utterance.
    Commit,
    /// Discard the accumulated input buffer.
    Clear,
    /// Session configuration.
    Control,
}

/// A frame handed to the session transport.
///
/// Invariant: `payload` for `Append` frames always has even length
/// (2-byte samples). Odd-length inbound payloads are zero-padded before
/// decode rather than rejected.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub kind: WireKind,
    /// Base64 text for `Append`, JSON bytes for `Control`, empty otherwise.
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl WireFrame {
    pub fn append(encoded: String) -> Self {
        Self {
            kind: WireKind::Append,
            payload: encoded.into_bytes(),
            timestamp: Utc::now(),
        }
    }

    pub fn commit() -> Self {
        Self {
            kind: WireKind::Commit,
            payload: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn clear() -> Self {
        Self {
            kind: WireKind::Clear,
            payload: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Encode normalized f32 samples to base64-framed PCM16.
///
/// Samples are clamped to [-1, 1] and scaled asymmetrically (32767 for
/// positive, 32768 for negative) so both rails are reachable without
/// overflow, then packed little-endian. The resulting byte payload length
/// is always `samples.len() * 2`.
pub fn encode(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let value = if clamped < 0.0 {
            (clamped * 32768.0) as i16
        } else {
            (clamped * 32767.0) as i16
        };
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(&bytes)
}

/// Decode a base64 PCM16 payload to normalized f32 samples, without the
/// conditioning pass. Odd-length payloads are padded with one zero byte
/// (truncated-frame tolerance) and logged rather than rejected.
pub fn decode_raw(payload: &str) -> VoiceResult<Vec<f32>> {
    if payload.is_empty() {
        return Err(VoiceError::Codec("empty audio payload".to_string()));
    }

    let mut bytes = STANDARD
        .decode(payload)
        .map_err(|e| VoiceError::Codec(format!("invalid base64 audio payload: {e}")))?;

    if bytes.is_empty() {
        return Err(VoiceError::Codec("zero-length audio payload".to_string()));
    }

    if bytes.len() % 2 != 0 {
        warn!(
            len = bytes.len(),
            "odd-length PCM16 payload, padding with zero byte"
        );
        bytes.push(0);
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            if value < 0 {
                value as f32 / 32768.0
            } else {
                value as f32 / 32767.0
            }
        })
        .collect();

    Ok(samples)
}

/// Condition decoded samples: subtract the buffer mean (DC offset removal)
/// and run a one-pole low-pass `y[i] = α·x[i] + (1-α)·y[i-1]`.
pub fn condition(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }

    let dc_offset = samples.iter().sum::<f32>() / samples.len() as f32;

    let mut prev = 0.0f32;
    for sample in samples.iter_mut() {
        let centered = *sample - dc_offset;
        prev = centered * SMOOTHING_ALPHA + prev * (1.0 - SMOOTHING_ALPHA);
        *sample = prev;
    }
}

/// Full inbound decode: base64 → PCM16 → normalized f32 → conditioned.
pub fn decode(payload: &str) -> VoiceResult<Vec<f32>> {
    let mut samples = decode_raw(payload)?;
    condition(&mut samples);
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_payload_length_is_two_bytes_per_sample() {
        let samples = vec![0.25f32; 4096 * 5];
        let encoded = encode(&samples);
        let bytes = STANDARD.decode(&encoded).unwrap();
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(bytes.len() % 2, 0);
    }

    #[test]
    fn round_trip_within_quantization_error() {
        let samples: Vec<f32> = (0..1000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .collect();

        let decoded = decode_raw(&encode(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());

        for (orig, dec) in samples.iter().zip(decoded.iter()) {
            assert!(
                (orig - dec).abs() <= 1.0 / 32767.0,
                "sample drifted beyond PCM16 quantization: {orig} vs {dec}"
            );
        }
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let decoded = decode_raw(&encode(&[2.0, -3.0])).unwrap();
        assert!((decoded[0] - 1.0).abs() <= 1.0 / 32767.0);
        assert!((decoded[1] + 1.0).abs() <= 1.0 / 32767.0);
    }

    #[test]
    fn odd_length_payload_pads_instead_of_failing() {
        // 3 raw bytes: one complete sample plus a dangling byte.
        let payload = STANDARD.encode([0x00u8, 0x40, 0x7f]);
        let decoded = decode_raw(&payload).unwrap();
        assert_eq!(decoded.len(), 2);
        // The dangling 0x7f gains a zero high byte: 0x007f, a small positive.
        assert!(decoded[1] > 0.0 && decoded[1] < 0.01);
    }

    #[test]
    fn empty_and_malformed_payloads_are_codec_errors() {
        assert!(matches!(decode_raw(""), Err(VoiceError::Codec(_))));
        assert!(matches!(
            decode_raw("!!!not-base64!!!"),
            Err(VoiceError::Codec(_))
        ));
    }

    #[test]
    fn condition_removes_dc_offset() {
        // Constant-offset signal: after DC removal the filtered output
        // settles back to zero.
        let mut samples = vec![0.5f32; 2048];
        condition(&mut samples);
        assert!(samples.last().unwrap().abs() < 1e-3);
    }

    #[test]
    fn condition_smooths_impulse_noise() {
        let mut samples = vec![0.0f32; 64];
        samples[32] = 1.0;
        condition(&mut samples);
        // A single-sample impulse passes through the one-pole filter at
        // most at alpha strength.
        assert!(samples[32] <= SMOOTHING_ALPHA + 1e-6);
    }

    #[test]
    fn wire_frame_constructors_tag_kinds() {
        assert_eq!(WireFrame::append(encode(&[0.0])).kind, WireKind::Append);
        assert_eq!(WireFrame::commit().kind, WireKind::Commit);
        assert_eq!(WireFrame::clear().kind, WireKind::Clear);
    }
}
