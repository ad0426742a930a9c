//! Frame codec
//!
//! Turns a still frame taken from a video surface into the base64 JPEG payload
//! of an `image/jpeg` media chunk.

use crate::sample_codec::{encode_base64, CodecError};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// JPEG quality used for outgoing frames.
pub const JPEG_QUALITY: u8 = 92;

pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// Pixel layout of a [`RawFrame`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba8,
    Rgb8,
}

impl PixelLayout {
    fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Rgb8 => 3,
        }
    }
}

/// Uncompressed frame as reported by a video surface.
///
/// A surface that has not produced video yet reports zero dimensions.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
}

impl RawFrame {
    /// A frame from a surface whose stream is not ready.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            layout: PixelLayout::Rgba8,
            pixels: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Encode a frame as JPEG bytes.
pub fn encode_jpeg(frame: &RawFrame) -> Result<Vec<u8>, CodecError> {
    let expected = frame.width as usize * frame.height as usize * frame.layout.bytes_per_pixel();
    if frame.pixels.len() != expected {
        return Err(CodecError::FrameSize {
            expected,
            actual: frame.pixels.len(),
        });
    }

    // JPEG has no alpha channel
    let rgb: std::borrow::Cow<'_, [u8]> = match frame.layout {
        PixelLayout::Rgb8 => frame.pixels.as_slice().into(),
        PixelLayout::Rgba8 => frame
            .pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect::<Vec<u8>>()
            .into(),
    };

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder.encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

/// Wrap JPEG bytes in a `data:` URI.
pub fn to_data_uri(jpeg: &[u8]) -> String {
    format!("data:{};base64,{}", JPEG_MIME_TYPE, encode_base64(jpeg))
}

/// Strip the `data:<mime>;base64,` scheme prefix, keeping only the payload.
///
/// Text without a prefix is returned trimmed but otherwise unchanged.
pub fn strip_data_uri_prefix(uri: &str) -> &str {
    match uri.split_once(',') {
        Some((scheme, payload)) if scheme.starts_with("data:") => payload.trim(),
        _ => uri.trim(),
    }
}

/// Encode a surface frame into the wire payload.
///
/// Returns `Ok(None)` when the frame has zero width or height, i.e. the
/// surface stream is not ready yet.
pub fn encode_frame(frame: &RawFrame) -> Result<Option<String>, CodecError> {
    if !frame.is_ready() {
        return Ok(None);
    }

    let jpeg = encode_jpeg(frame)?;
    let uri = to_data_uri(&jpeg);
    Ok(Some(strip_data_uri_prefix(&uri).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_codec::decode_base64;

    fn solid_frame(width: u32, height: u32, layout: PixelLayout) -> RawFrame {
        let px: &[u8] = match layout {
            PixelLayout::Rgba8 => &[200, 40, 10, 255],
            PixelLayout::Rgb8 => &[200, 40, 10],
        };
        RawFrame {
            width,
            height,
            layout,
            pixels: px.repeat((width * height) as usize),
        }
    }

    #[test]
    fn frame_encodes_to_bare_base64_jpeg() {
        let payload = encode_frame(&solid_frame(32, 24, PixelLayout::Rgba8))
            .unwrap()
            .expect("frame is ready");

        assert!(!payload.starts_with("data:"));
        let bytes = decode_base64(&payload).unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn rgb_frames_are_accepted() {
        assert!(encode_frame(&solid_frame(8, 8, PixelLayout::Rgb8)).unwrap().is_some());
    }

    #[test]
    fn zero_sized_frame_is_skipped() {
        assert!(encode_frame(&RawFrame::empty()).unwrap().is_none());

        let mut frame = solid_frame(4, 4, PixelLayout::Rgba8);
        frame.height = 0;
        assert!(encode_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn mismatched_buffer_is_an_error() {
        let mut frame = solid_frame(4, 4, PixelLayout::Rgba8);
        frame.pixels.truncate(10);
        assert!(matches!(
            encode_frame(&frame),
            Err(CodecError::FrameSize { expected: 64, actual: 10 })
        ));
    }

    #[test]
    fn data_uri_prefix_is_stripped() {
        assert_eq!(strip_data_uri_prefix("data:image/jpeg;base64,QUJD "), "QUJD");
        assert_eq!(strip_data_uri_prefix("QUJD"), "QUJD");
        assert!(to_data_uri(b"ABC").starts_with("data:image/jpeg;base64,"));
    }
}
