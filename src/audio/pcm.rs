//! PCM16 helpers for the realtime wire format.
//!
//! - Capture side: f32 samples → clamp → PCM16 little-endian → (optional) base64
//! - Playback side: base64 → PCM16 → f32 samples
//!
//! All functions are pure. The f32 → PCM16 → f32 round trip is lossy
//! (quantization); the bytes → base64 → bytes round trip is exact.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Scale for positive samples. Negative samples use `PCM16_NEG_SCALE` so that
/// -1.0 maps to `i16::MIN` and 1.0 to `i16::MAX`.
pub const PCM16_POS_SCALE: f32 = 32767.0;
pub const PCM16_NEG_SCALE: f32 = 32768.0;

/// Convert one f32 sample in [-1, 1] to a signed 16-bit sample. Out-of-range
/// input is clamped; NaN maps to silence.
pub fn float_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * PCM16_NEG_SCALE } else { s * PCM16_POS_SCALE };
    scaled.round() as i16
}

/// Inverse of [`float_to_pcm16`].
pub fn pcm16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / PCM16_NEG_SCALE
    } else {
        sample as f32 / PCM16_POS_SCALE
    }
}

/// Encode f32 samples as interleaved little-endian PCM16 bytes.
pub fn float32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&float_to_pcm16(s).to_le_bytes());
    }
    out
}

/// Decode little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn pcm16_bytes_to_float32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_float(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

pub fn bytes_to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn base64_to_bytes(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(text.trim())
}

/// f32 samples → base64 PCM16, the payload of `input_audio_buffer.append`.
pub fn float32_to_base64_pcm16(samples: &[f32]) -> String {
    bytes_to_base64(&float32_to_pcm16_bytes(samples))
}

/// base64 PCM16 (e.g. an `audio.delta` payload) → f32 samples.
pub fn base64_pcm16_to_float32(text: &str) -> Result<Vec<f32>, base64::DecodeError> {
    Ok(pcm16_bytes_to_float32(&base64_to_bytes(text)?))
}

/// Average two channels sample by sample. The output is as long as the
/// shorter input.
pub fn stereo_to_mono(left: &[f32], right: &[f32]) -> Vec<f32> {
    left.iter()
        .zip(right.iter())
        .map(|(l, r)| (l + r) / 2.0)
        .collect()
}

/// Same as [`stereo_to_mono`] for interleaved `L R L R ...` input.
pub fn interleaved_stereo_to_mono(samples: &[f32]) -> Vec<f32> {
    samples
        .chunks_exact(2)
        .map(|pair| (pair[0] + pair[1]) / 2.0)
        .collect()
}

/// Downsample by linear interpolation between neighbouring input samples.
///
/// Output length is `floor(len * rate_out / rate_in)`. Equal rates return a
/// copy. Upsampling is not performed: if `rate_out > rate_in` the input is
/// returned unchanged.
pub fn downsample(input: &[f32], rate_in: u32, rate_out: u32) -> Vec<f32> {
    if rate_in == 0 || rate_out == 0 {
        return Vec::new();
    }
    if rate_out >= rate_in {
        return input.to_vec();
    }

    let ratio = rate_in as f64 / rate_out as f64;
    let out_len = (input.len() as u64 * rate_out as u64 / rate_in as u64) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = input[idx];
        let b = input.get(idx + 1).copied().unwrap_or(a);
        output.push(a + (b - a) * frac);
    }
    output
}

/// RMS level of a block, 0.0 for empty input.
pub fn volume_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Playback length of `sample_count` mono samples.
pub fn duration_secs(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}
