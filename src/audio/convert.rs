//! Sample-rate and sample-format conversion.
//!
//! Linear interpolation only, no anti-aliasing filter. Both relay directions
//! use the same functions with the rates swapped.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Resample by linear interpolation between neighbouring input samples.
///
/// Output length is `floor(input.len() * out_rate / in_rate)`. Empty input
/// (or a zero rate) yields empty output.
pub fn resample(input: &[f32], in_rate: u32, out_rate: u32) -> Vec<f32> {
    if input.is_empty() || in_rate == 0 || out_rate == 0 {
        return Vec::new();
    }
    if in_rate == out_rate {
        return input.to_vec();
    }

    let out_len = (input.len() as u64 * out_rate as u64 / in_rate as u64) as usize;
    let step = in_rate as f64 / out_rate as f64;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let lo = (pos.floor() as usize).min(last);
            let hi = (pos.ceil() as usize).min(last);
            let frac = (pos - lo as f64) as f32;
            input[lo] + (input[hi] - input[lo]) * frac
        })
        .collect()
}

/// Clamp to [-1, 1] and scale asymmetrically: negatives by 32768, positives
/// by 32767. Truncates toward zero.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Little-endian byte layout used on the wire.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Inverse of [`pcm16_to_bytes`]. A trailing odd byte is ignored.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Meeting-rate float samples to the base64 PCM16 payload of an
/// `input_audio_buffer.append` event.
pub fn encode_pcm16_base64(samples: &[f32], in_rate: u32, out_rate: u32) -> String {
    let resampled = resample(samples, in_rate, out_rate);
    let pcm = float_to_pcm16(&resampled);
    BASE64.encode(pcm16_to_bytes(&pcm))
}
