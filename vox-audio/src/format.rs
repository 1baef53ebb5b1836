//! Audio format definitions and PCM16 conversions.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sample rate of microphone audio sent upstream.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized audio received from the service.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Complete audio format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz (e.g., 24000, 16000).
    pub sample_rate: u32,
    /// Number of audio channels (1 = mono).
    pub channels: u8,
    /// Bits per sample.
    pub bits_per_sample: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_24khz()
    }
}

impl AudioFormat {
    /// PCM16 mono at 24kHz (playback).
    pub fn pcm16_24khz() -> Self {
        Self { sample_rate: PLAYBACK_SAMPLE_RATE, channels: 1, bits_per_sample: 16 }
    }

    /// PCM16 mono at 16kHz (capture).
    pub fn pcm16_16khz() -> Self {
        Self { sample_rate: CAPTURE_SAMPLE_RATE, channels: 1, bits_per_sample: 16 }
    }

    /// MIME type used on the wire, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// An immutable block of 16-bit little-endian PCM samples.
///
/// Produced by the capture pipeline or received from the network, and
/// consumed exactly once (encoded for send, or scheduled for playback).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    data: Bytes,
    format: AudioFormat,
}

impl AudioBlock {
    /// Create a new audio block.
    pub fn new(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self { data: data.into(), format }
    }

    /// Format of this block.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Encode the block as base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Create a block from i16 samples.
    pub fn from_i16_samples(samples: &[i16], format: AudioFormat) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(data, format)
    }
}

/// Convert a float sample to signed 16-bit, clamping to [-1, 1] and scaling by 32767.
#[inline]
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Convert a signed 16-bit sample to a normalized float.
#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Buffers samples until a target duration is reached.
///
/// The capture side coalesces 128-sample render blocks into larger chunks
/// with this before encoding, which keeps the outbound message rate sane.
#[derive(Debug, Clone)]
pub struct SmartAudioBuffer {
    buffer: Vec<i16>,
    sample_rate: u32,
    target_duration_ms: u32,
}

impl SmartAudioBuffer {
    /// Create a new smart audio buffer.
    pub fn new(sample_rate: u32, target_duration_ms: u32) -> Self {
        Self { buffer: Vec::new(), sample_rate, target_duration_ms }
    }

    /// Push new samples into the buffer.
    pub fn push(&mut self, samples: &[i16]) {
        self.buffer.extend_from_slice(samples);
    }

    /// Number of samples currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn should_flush(&self) -> bool {
        let duration_ms = (self.buffer.len() as f64 / self.sample_rate as f64) * 1000.0;
        duration_ms >= self.target_duration_ms as f64
    }

    /// Flush the buffer if the target duration has been reached.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.should_flush() { Some(std::mem::take(&mut self.buffer)) } else { None }
    }

    /// Flush any remaining samples in the buffer.
    pub fn flush_remaining(&mut self) -> Option<Vec<i16>> {
        if self.buffer.is_empty() { None } else { Some(std::mem::take(&mut self.buffer)) }
    }
}
