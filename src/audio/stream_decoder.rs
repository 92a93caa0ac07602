//! Decoders for synthesized audio payloads arriving from the speech service.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::convert::{bytes_to_pcm16, pcm16_to_float, resample};
use crate::config::AudioConfig;

/// Turns one wire payload into float samples at the meeting rate.
///
/// Implementations handle format-specific decoding and resampling
/// internally.
pub trait StreamDecoder: Send {
    fn decode(&mut self, payload: &str) -> Result<Vec<f32>>;
}

/// base64 PCM16 LE at the service rate.
pub struct Pcm16Decoder {
    service_rate: u32,
    meeting_rate: u32,
}

impl Pcm16Decoder {
    pub fn new(service_rate: u32, meeting_rate: u32) -> Self {
        Self {
            service_rate,
            meeting_rate,
        }
    }
}

impl StreamDecoder for Pcm16Decoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<f32>> {
        let bytes = STANDARD
            .decode(payload)
            .context("audio delta is not valid base64")?;
        let pcm = bytes_to_pcm16(&bytes);
        let samples = pcm16_to_float(&pcm);
        Ok(resample(&samples, self.service_rate, self.meeting_rate))
    }
}

/// Pick a decoder for the configured `stream_format`.
pub fn create_decoder(audio: &AudioConfig) -> Result<Box<dyn StreamDecoder>> {
    match audio.stream_format.as_str() {
        "pcm16" => Ok(Box::new(Pcm16Decoder::new(
            audio.service_sample_rate,
            audio.meeting_sample_rate,
        ))),
        other => bail!("Unsupported stream format: {}", other),
    }
}
