//! Screen surfaces backed by `xcap`
#[cfg(feature = "capture")]
use crate::frame_codec::{PixelLayout, RawFrame};
#[cfg(feature = "capture")]
use xcap::Monitor;
#[cfg(feature = "capture")]
use tracing::info;

use crate::device::{CaptureError, VideoSurface};

/// Captures the primary monitor on demand.
///
/// Only the monitor id is kept; the monitor is looked up again on every
/// snapshot so the surface stays `Send` and survives display reconfiguration.
#[cfg(feature = "capture")]
pub struct ScreenSurface {
    monitor_id: u32,
    stopped: bool,
}

#[cfg(feature = "capture")]
fn backend_error(e: xcap::XCapError) -> CaptureError {
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("permission") {
        CaptureError::PermissionDenied(msg)
    } else {
        CaptureError::Backend(msg)
    }
}

#[cfg(feature = "capture")]
impl ScreenSurface {
    /// Pick the primary monitor, falling back to the first one.
    pub fn open() -> Result<Self, CaptureError> {
        let monitors = Monitor::all().map_err(backend_error)?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .ok_or_else(|| CaptureError::DeviceUnavailable("no monitors found".to_string()))?;

        let monitor_id = monitor.id().map_err(backend_error)?;
        info!(
            "Sharing monitor {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0)
        );

        Ok(Self {
            monitor_id,
            stopped: false,
        })
    }
}

#[cfg(feature = "capture")]
impl VideoSurface for ScreenSurface {
    fn snapshot(&mut self) -> Result<RawFrame, CaptureError> {
        if self.stopped {
            return Ok(RawFrame::empty());
        }

        let monitors = Monitor::all().map_err(backend_error)?;
        let monitor = monitors
            .into_iter()
            .find(|m| m.id().ok() == Some(self.monitor_id))
            .ok_or_else(|| CaptureError::DeviceUnavailable("shared monitor went away".to_string()))?;
        let image = monitor.capture_image().map_err(backend_error)?;

        Ok(RawFrame {
            width: image.width(),
            height: image.height(),
            layout: PixelLayout::Rgba8,
            pixels: image.into_raw(),
        })
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Open the screen surface, or report that capture support is missing.
pub fn open_screen() -> Result<Box<dyn VideoSurface>, CaptureError> {
    #[cfg(feature = "capture")]
    {
        Ok(Box::new(ScreenSurface::open()?))
    }
    #[cfg(not(feature = "capture"))]
    {
        Err(CaptureError::Unsupported("screen capture"))
    }
}
