//! audio - Sample conversion, playback queueing and stream decoding
//!
//! Everything in here works on mono `f32` samples at the meeting's native
//! rate. The speech service only ever sees PCM16 at its own rate; the
//! conversion between the two lives in [`convert`].

pub mod convert;
pub mod playback;
pub mod stream_decoder;

pub use playback::{Delivery, PlaybackQueue, VirtualMic};
pub use stream_decoder::{StreamDecoder, create_decoder};

/// One captured buffer of mono `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }
}
