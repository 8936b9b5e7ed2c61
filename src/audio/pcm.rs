//! PCM sample conversion and the base64 PCM16 wire encoding.

use crate::error::DecodeError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation resampler.
///
/// Speech energy sits below 8kHz, so no anti-alias filter is applied when
/// going from a 44.1/48kHz device rate down to 16kHz.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Linear-interpolation resampler for a continuous stream.
///
/// Device callbacks rarely hold a whole number of output periods. The read
/// position and the last input sample carry over between calls, so a stream
/// fed in pieces resamples like one contiguous buffer.
#[derive(Debug, Clone, Default)]
pub struct StreamResampler {
    /// Next read position, relative to `carry` when it is set.
    position: f64,
    carry: Option<f32>,
}

impl StreamResampler {
    pub fn process(&mut self, samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
        if src_rate == dst_rate || src_rate == 0 || dst_rate == 0 {
            return samples.to_vec();
        }
        if samples.is_empty() {
            return Vec::new();
        }

        let offset = usize::from(self.carry.is_some());
        let len = samples.len() + offset;
        let at = |i: usize| match (i, self.carry) {
            (0, Some(carry)) => carry,
            _ => samples[i - offset],
        };

        let ratio = src_rate as f64 / dst_rate as f64;
        let mut output = Vec::with_capacity((samples.len() as f64 / ratio) as usize + 1);
        let mut position = self.position;
        while (position as usize) + 1 < len {
            let idx = position as usize;
            let frac = position - idx as f64;
            let sample = at(idx) as f64 * (1.0 - frac) + at(idx + 1) as f64 * frac;
            output.push(sample as f32);
            position += ratio;
        }

        self.position = position - (len - 1) as f64;
        self.carry = samples.last().copied();
        output
    }

    /// Forget the carried phase, e.g. after a gap in the input.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Convert f32 samples in \[-1, 1\] to signed 16-bit PCM, clamping overs.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

/// Encode PCM16 samples as little-endian bytes in standard base64.
pub fn encode_pcm16_base64(pcm: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for s in pcm {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode a base64 little-endian PCM16 payload into f32 samples.
///
/// # Errors
///
/// Returns [`DecodeError`] for invalid base64, an odd byte count, or an
/// empty payload.
pub fn decode_pcm16_base64(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}
