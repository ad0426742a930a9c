//! Device seams
//!
//! Capture managers never talk to hardware directly. They go through these
//! traits so the PulseAudio, xcap and nokhwa backends can be swapped for fakes
//! and so a missing backend degrades to an error instead of a panic.

use crate::frame_codec::RawFrame;
use std::sync::Arc;

/// Error type for device acquisition and capture
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("{0} support not compiled in")]
    Unsupported(&'static str),

    #[error("acquisition cancelled by a newer request")]
    Cancelled,

    #[error("capture backend error: {0}")]
    Backend(String),
}

/// Callback invoked by an input device with normalized mono samples.
pub type SampleSink = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// A running device stream. Stopping releases the device.
pub trait DeviceStream: Send {
    /// Stop the stream and release the device. Must be idempotent.
    fn stop(&mut self);
}

/// Opens microphone streams.
pub trait AudioInputBackend: Send + Sync {
    /// Open a mono input stream at `sample_rate`, delivering samples to `sink`.
    ///
    /// Called on the blocking pool; implementations may block while the
    /// device is acquired.
    fn open(
        &self,
        device_id: Option<&str>,
        sample_rate: u32,
        sink: SampleSink,
    ) -> Result<Box<dyn DeviceStream>, CaptureError>;
}

/// A live video surface (camera preview or shared screen).
pub trait VideoSurface: Send {
    /// Current frame. Zero dimensions mean the stream is not ready yet.
    fn snapshot(&mut self) -> Result<RawFrame, CaptureError>;

    /// Release all tracks. Must be idempotent.
    fn stop(&mut self);
}

/// Opens camera and screen surfaces.
pub trait VisualBackend: Send + Sync {
    fn open_camera(&self, device_id: Option<&str>) -> Result<Box<dyn VideoSurface>, CaptureError>;

    fn open_screen(&self) -> Result<Box<dyn VideoSurface>, CaptureError>;
}

/// Backend used when no visual capture support is compiled in.
#[derive(Debug, Default)]
pub struct NoVisualBackend;

impl VisualBackend for NoVisualBackend {
    fn open_camera(&self, _device_id: Option<&str>) -> Result<Box<dyn VideoSurface>, CaptureError> {
        Err(CaptureError::Unsupported("camera capture"))
    }

    fn open_screen(&self) -> Result<Box<dyn VideoSurface>, CaptureError> {
        Err(CaptureError::Unsupported("screen capture"))
    }
}

/// Camera through `nokhwa`, screen through `xcap`.
#[derive(Debug, Default)]
pub struct NativeVisual;

impl VisualBackend for NativeVisual {
    fn open_camera(&self, device_id: Option<&str>) -> Result<Box<dyn VideoSurface>, CaptureError> {
        crate::camera::open_camera(device_id)
    }

    fn open_screen(&self) -> Result<Box<dyn VideoSurface>, CaptureError> {
        crate::screen::open_screen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_backend_is_unsupported() {
        assert!(matches!(
            NoVisualBackend.open_screen(),
            Err(CaptureError::Unsupported(_))
        ));
        assert!(matches!(
            NoVisualBackend.open_camera(Some("0")),
            Err(CaptureError::Unsupported(_))
        ));
    }

    #[cfg(not(feature = "capture"))]
    #[test]
    fn native_backend_without_capture_support() {
        assert_eq!(
            NativeVisual.open_screen().err(),
            Some(CaptureError::Unsupported("screen capture"))
        );
    }
}
