//! Camera surfaces backed by `nokhwa`
//!
//! The camera is driven from its own thread, which keeps decoding frames into
//! a shared slot. Snapshots just copy the newest decoded frame.

use crate::device::{CaptureError, VideoSurface};

#[cfg(feature = "capture")]
use crate::frame_codec::{PixelLayout, RawFrame};
#[cfg(feature = "capture")]
use crate::util::lock;
#[cfg(feature = "capture")]
use nokhwa::pixel_format::RgbFormat;
#[cfg(feature = "capture")]
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
#[cfg(feature = "capture")]
use nokhwa::Camera;
#[cfg(feature = "capture")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "capture")]
use std::sync::{mpsc, Arc, Mutex};
#[cfg(feature = "capture")]
use std::thread::JoinHandle;
#[cfg(feature = "capture")]
use std::time::Duration;
#[cfg(feature = "capture")]
use tracing::{debug, error, info, warn};

/// Numeric ids select by index, anything else by name.
#[cfg(feature = "capture")]
fn camera_index(device_id: Option<&str>) -> CameraIndex {
    match device_id {
        None => CameraIndex::Index(0),
        Some(id) => match id.parse::<u32>() {
            Ok(n) => CameraIndex::Index(n),
            Err(_) => CameraIndex::String(id.to_string()),
        },
    }
}

#[cfg(feature = "capture")]
fn camera_error(e: nokhwa::NokhwaError) -> CaptureError {
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("permission") {
        CaptureError::PermissionDenied(msg)
    } else {
        CaptureError::DeviceUnavailable(msg)
    }
}

#[cfg(feature = "capture")]
pub struct CameraSurface {
    latest: Arc<Mutex<Option<RawFrame>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[cfg(feature = "capture")]
impl CameraSurface {
    /// Open the camera and wait until its stream is running.
    pub fn open(device_id: Option<&str>) -> Result<Self, CaptureError> {
        let latest = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let index = camera_index(device_id);
        let slot = latest.clone();
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || camera_loop(index, slot, flag, ready_tx))
            .map_err(|e| CaptureError::Backend(format!("failed to spawn camera thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                latest,
                shutdown,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Backend("camera thread exited during setup".to_string()))
            }
        }
    }
}

#[cfg(feature = "capture")]
fn camera_loop(
    index: CameraIndex,
    latest: Arc<Mutex<Option<RawFrame>>>,
    shutdown: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), CaptureError>>,
) {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = match Camera::new(index.clone(), requested) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready_tx.send(Err(camera_error(e)));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = ready_tx.send(Err(camera_error(e)));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let format = camera.camera_format();
    info!(
        "Camera {} streaming {}x{} @{} {:?}",
        index,
        format.resolution().width(),
        format.resolution().height(),
        format.frame_rate(),
        format.format()
    );

    while !shutdown.load(Ordering::Relaxed) {
        let decoded = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>());
        match decoded {
            Ok(image) => {
                let frame = RawFrame {
                    width: image.width(),
                    height: image.height(),
                    layout: PixelLayout::Rgb8,
                    pixels: image.into_raw(),
                };
                *lock(&latest) = Some(frame);
            }
            Err(e) => {
                warn!("Camera frame error: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    if let Err(e) = camera.stop_stream() {
        debug!("Camera stop_stream failed: {}", e);
    }
    debug!("Camera thread exiting");
}

#[cfg(feature = "capture")]
impl VideoSurface for CameraSurface {
    fn snapshot(&mut self) -> Result<RawFrame, CaptureError> {
        Ok(lock(&self.latest).clone().unwrap_or_else(RawFrame::empty))
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Camera thread panicked");
            }
        }
        *lock(&self.latest) = None;
    }
}

#[cfg(feature = "capture")]
impl Drop for CameraSurface {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a camera surface, or report that capture support is missing.
pub fn open_camera(device_id: Option<&str>) -> Result<Box<dyn VideoSurface>, CaptureError> {
    #[cfg(feature = "capture")]
    {
        Ok(Box::new(CameraSurface::open(device_id)?))
    }
    #[cfg(not(feature = "capture"))]
    {
        let _ = device_id;
        Err(CaptureError::Unsupported("camera capture"))
    }
}
