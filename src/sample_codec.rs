//! Sample codec
//!
//! Stateless conversions used on both audio paths: normalized `f32` samples to
//! 16-bit little-endian PCM and back, and raw bytes to the base64 text carried
//! in the JSON frames.

use base64::engine::general_purpose;
use base64::Engine;

/// Sample rate of audio sent to the service (mono).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio received from the service (mono).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddByteLength(usize),

    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Convert normalized samples to PCM16LE bytes.
///
/// Samples outside `[-1.0, 1.0]` are clamped rather than wrapped.
pub fn f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert PCM16LE bytes to normalized samples (each value divided by 32768).
pub fn pcm16le_to_f32(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddByteLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(text.trim())?)
}

/// Encode captured samples into the text form of an `audio/pcm` media chunk.
pub fn encode_chunk(samples: &[f32]) -> String {
    encode_base64(&f32_to_pcm16le(samples))
}

/// Decode an inbound audio payload into samples ready for rendering.
pub fn decode_chunk(base64_pcm: &str) -> Result<Vec<f32>, CodecError> {
    pcm16le_to_f32(&decode_base64(base64_pcm)?)
}
