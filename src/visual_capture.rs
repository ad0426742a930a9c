//! Camera and screen capture
//!
//! One manager owns both visual sources so that at most one of them is ever
//! active. Once per frame interval the active surface is snapshotted and the
//! still is sent out as a base64 JPEG.

use crate::device::{CaptureError, VideoSurface, VisualBackend};
use crate::events::CaptureEvent;
use crate::frame_codec::encode_frame;
use crate::util::lock;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a frame is taken from the active surface
pub const FRAME_INTERVAL: Duration = Duration::from_secs(1);

/// A visual capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisualSource {
    /// `None` uses the selected camera (or the system default)
    Camera { device_id: Option<String> },
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualKind {
    Camera,
    Screen,
}

impl VisualSource {
    pub fn kind(&self) -> VisualKind {
        match self {
            Self::Camera { .. } => VisualKind::Camera,
            Self::Screen => VisualKind::Screen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Acquiring,
    Active,
}

type SharedSurface = Arc<Mutex<Box<dyn VideoSurface>>>;

struct Inner {
    generation: u64,
    phase: Phase,
    source: Option<VisualSource>,
    camera_device: Option<String>,
    surface: Option<SharedSurface>,
    timer: Option<JoinHandle<()>>,
}

/// Owns the active visual source and its frame timer.
pub struct VisualCaptureManager {
    backend: Arc<dyn VisualBackend>,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    frame_interval: Duration,
}

impl VisualCaptureManager {
    pub fn new(
        backend: Arc<dyn VisualBackend>,
        camera_device: Option<String>,
        events_tx: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(Inner {
                generation: 0,
                phase: Phase::Idle,
                source: None,
                camera_device,
                surface: None,
                timer: None,
            })),
            events_tx,
            frame_interval: FRAME_INTERVAL,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// The source currently delivering frames.
    pub fn active_source(&self) -> Option<VisualSource> {
        let inner = lock(&self.inner);
        match inner.phase {
            Phase::Active => inner.source.clone(),
            _ => None,
        }
    }

    pub fn is_active(&self, kind: VisualKind) -> bool {
        self.active_source().map(|s| s.kind()) == Some(kind)
    }

    /// Camera the next camera start will open.
    pub fn camera_device(&self) -> Option<String> {
        lock(&self.inner).camera_device.clone()
    }

    /// Start `source`, stopping the other source first if it is running.
    pub async fn start(&self, source: VisualSource) -> Result<(), CaptureError> {
        let (generation, source, previous) = {
            let mut inner = lock(&self.inner);
            let source = match source {
                VisualSource::Camera { device_id: Some(id) } => {
                    inner.camera_device = Some(id.clone());
                    VisualSource::Camera { device_id: Some(id) }
                }
                VisualSource::Camera { device_id: None } => VisualSource::Camera {
                    device_id: inner.camera_device.clone(),
                },
                VisualSource::Screen => VisualSource::Screen,
            };

            if inner.phase != Phase::Idle && inner.source.as_ref() == Some(&source) {
                debug!("{:?} already {:?}, start ignored", source.kind(), inner.phase);
                return Ok(());
            }

            let previous = release(&mut inner);
            inner.phase = Phase::Acquiring;
            inner.source = Some(source.clone());
            (inner.generation, source, previous)
        };
        previous.stop();

        info!("Opening {:?} capture", source.kind());
        let backend = self.backend.clone();
        let target = source.clone();
        let opened = tokio::task::spawn_blocking(move || match &target {
            VisualSource::Camera { device_id } => backend.open_camera(device_id.as_deref()),
            VisualSource::Screen => backend.open_screen(),
        })
        .await
        .unwrap_or_else(|e| Err(CaptureError::Backend(format!("device task failed: {}", e))));

        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            drop(inner);
            if let Ok(mut surface) = opened {
                surface.stop();
            }
            debug!("{:?} acquisition superseded, surface released", source.kind());
            return Err(CaptureError::Cancelled);
        }

        match opened {
            Ok(surface) => {
                let surface: SharedSurface = Arc::new(Mutex::new(surface));
                inner.timer = Some(self.spawn_frame_timer(generation, surface.clone()));
                inner.surface = Some(surface);
                inner.phase = Phase::Active;
                info!("{:?} capture started", source.kind());
                Ok(())
            }
            Err(e) => {
                inner.phase = Phase::Idle;
                inner.source = None;
                warn!("{:?} capture unavailable: {}", source.kind(), e);
                Err(e)
            }
        }
    }

    /// Stop whichever source is running. Idempotent.
    pub fn stop(&self) {
        let released = release(&mut lock(&self.inner));
        released.stop();
    }

    /// Select another camera. Restarts the camera only if it is running.
    pub async fn switch_camera(&self, device_id: Option<String>) -> Result<(), CaptureError> {
        let restart = {
            let mut inner = lock(&self.inner);
            inner.camera_device = device_id.clone();
            inner.phase != Phase::Idle
                && matches!(inner.source, Some(VisualSource::Camera { .. }))
        };
        if !restart {
            return Ok(());
        }

        self.stop();
        self.start(VisualSource::Camera { device_id }).await
    }

    /// Take and emit one frame from the active surface now.
    ///
    /// Returns `Ok(false)` when nothing is active or the surface has no video yet.
    pub async fn capture_now(&self) -> Result<bool, CaptureError> {
        let (generation, surface) = {
            let inner = lock(&self.inner);
            match (&inner.surface, inner.phase) {
                (Some(surface), Phase::Active) => (inner.generation, surface.clone()),
                _ => return Ok(false),
            }
        };
        match capture_frame(&self.inner, &surface, generation, &self.events_tx).await {
            Frame::Emitted => Ok(true),
            Frame::NotReady | Frame::Stale => Ok(false),
            Frame::Failed(e) => Err(CaptureError::Backend(e)),
        }
    }

    fn spawn_frame_timer(&self, generation: u64, surface: SharedSurface) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let events_tx = self.events_tx.clone();
        let period = self.frame_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match capture_frame(&inner, &surface, generation, &events_tx).await {
                    Frame::Stale => break,
                    Frame::Failed(e) => warn!("Frame capture failed: {}", e),
                    Frame::Emitted | Frame::NotReady => {}
                }
            }
        })
    }
}

impl Drop for VisualCaptureManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resources detached from the manager, released outside the lock.
struct Released {
    timer: Option<JoinHandle<()>>,
    surface: Option<SharedSurface>,
    kind: Option<VisualKind>,
}

impl Released {
    fn stop(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Some(surface) = self.surface {
            lock(&surface).stop();
        }
        if let Some(kind) = self.kind {
            info!("{:?} capture stopped", kind);
        }
    }
}

fn release(inner: &mut Inner) -> Released {
    inner.generation += 1;
    let was_running = inner.phase != Phase::Idle;
    inner.phase = Phase::Idle;
    let source = inner.source.take();
    Released {
        timer: inner.timer.take(),
        surface: inner.surface.take(),
        kind: source.filter(|_| was_running).map(|s| s.kind()),
    }
}

enum Frame {
    Emitted,
    NotReady,
    Stale,
    Failed(String),
}

async fn capture_frame(
    inner: &Mutex<Inner>,
    surface: &SharedSurface,
    generation: u64,
    events_tx: &mpsc::UnboundedSender<CaptureEvent>,
) -> Frame {
    if lock(inner).generation != generation {
        return Frame::Stale;
    }

    let surface = surface.clone();
    let encoded = tokio::task::spawn_blocking(move || -> Result<Option<String>, String> {
        let frame = lock(&surface).snapshot().map_err(|e| e.to_string())?;
        encode_frame(&frame).map_err(|e| e.to_string())
    })
    .await
    .unwrap_or_else(|e| Err(format!("frame task failed: {}", e)));

    match encoded {
        Ok(Some(jpeg)) => {
            // Checked under the lock so no frame is queued after a stop returns
            let inner = lock(inner);
            if inner.generation != generation {
                return Frame::Stale;
            }
            debug!("Captured frame ({} base64 chars)", jpeg.len());
            if events_tx.send(CaptureEvent::VideoFrame(jpeg)).is_err() {
                return Frame::Stale;
            }
            Frame::Emitted
        }
        Ok(None) => Frame::NotReady,
        Err(e) => Frame::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::{PixelLayout, RawFrame};
    use crate::sample_codec::decode_base64;

    #[derive(Default)]
    struct FakeVision {
        ready: bool,
        deny_screen: bool,
        opened: Mutex<Vec<String>>,
        stopped: Arc<Mutex<Vec<String>>>,
    }

    struct FakeSurface {
        label: String,
        ready: bool,
        stopped: Arc<Mutex<Vec<String>>>,
        done: bool,
    }

    impl VideoSurface for FakeSurface {
        fn snapshot(&mut self) -> Result<RawFrame, CaptureError> {
            if !self.ready {
                return Ok(RawFrame::empty());
            }
            Ok(RawFrame {
                width: 2,
                height: 2,
                layout: PixelLayout::Rgba8,
                pixels: vec![200; 16],
            })
        }

        fn stop(&mut self) {
            if !self.done {
                self.done = true;
                self.stopped.lock().unwrap().push(self.label.clone());
            }
        }
    }

    impl FakeVision {
        fn surface(&self, label: String) -> Box<dyn VideoSurface> {
            self.opened.lock().unwrap().push(label.clone());
            Box::new(FakeSurface {
                label,
                ready: self.ready,
                stopped: self.stopped.clone(),
                done: false,
            })
        }
    }

    impl VisualBackend for FakeVision {
        fn open_camera(&self, device_id: Option<&str>) -> Result<Box<dyn VideoSurface>, CaptureError> {
            Ok(self.surface(format!("camera:{}", device_id.unwrap_or("default"))))
        }

        fn open_screen(&self) -> Result<Box<dyn VideoSurface>, CaptureError> {
            if self.deny_screen {
                return Err(CaptureError::PermissionDenied("screen share dismissed".to_string()));
            }
            Ok(self.surface("screen".to_string()))
        }
    }

    fn manager(
        vision: FakeVision,
    ) -> (
        Arc<FakeVision>,
        VisualCaptureManager,
        mpsc::UnboundedReceiver<CaptureEvent>,
    ) {
        let vision = Arc::new(vision);
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = VisualCaptureManager::new(vision.clone(), None, tx);
        (vision, manager, rx)
    }

    fn camera() -> VisualSource {
        VisualSource::Camera { device_id: None }
    }

    #[tokio::test]
    async fn camera_and_screen_are_exclusive() {
        let (vision, manager, _rx) = manager(FakeVision::default());

        manager.start(camera()).await.unwrap();
        assert!(manager.is_active(VisualKind::Camera));

        manager.start(VisualSource::Screen).await.unwrap();
        assert_eq!(manager.active_source(), Some(VisualSource::Screen));
        assert_eq!(*vision.stopped.lock().unwrap(), vec!["camera:default"]);

        manager.start(camera()).await.unwrap();
        assert!(manager.is_active(VisualKind::Camera));
        assert_eq!(
            *vision.stopped.lock().unwrap(),
            vec!["camera:default", "screen"]
        );
    }

    #[tokio::test]
    async fn denied_screen_still_stops_camera() {
        let (vision, manager, _rx) = manager(FakeVision {
            deny_screen: true,
            ..FakeVision::default()
        });
        manager.start(camera()).await.unwrap();

        let err = manager.start(VisualSource::Screen).await.unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert_eq!(manager.active_source(), None);
        assert_eq!(*vision.stopped.lock().unwrap(), vec!["camera:default"]);
    }

    #[tokio::test]
    async fn frame_without_video_is_skipped() {
        let (_vision, manager, mut rx) = manager(FakeVision::default());
        manager.start(VisualSource::Screen).await.unwrap();

        assert!(!manager.capture_now().await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ready_frame_is_sent_as_jpeg() {
        let (_vision, manager, mut rx) = manager(FakeVision {
            ready: true,
            ..FakeVision::default()
        });
        manager.start(camera()).await.unwrap();

        assert!(manager.capture_now().await.unwrap());
        match rx.try_recv().unwrap() {
            CaptureEvent::VideoFrame(data) => {
                assert!(!data.starts_with("data:"));
                let jpeg = decode_base64(&data).unwrap();
                assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn timer_emits_frames() {
        let (_vision, manager, mut rx) = manager(FakeVision {
            ready: true,
            ..FakeVision::default()
        });
        let manager = manager.with_frame_interval(Duration::from_millis(20));
        manager.start(VisualSource::Screen).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CaptureEvent::VideoFrame(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (vision, manager, _rx) = manager(FakeVision::default());
        manager.stop();
        manager.start(VisualSource::Screen).await.unwrap();
        manager.stop();
        manager.stop();

        assert_eq!(manager.active_source(), None);
        assert_eq!(*vision.stopped.lock().unwrap(), vec!["screen"]);
        assert!(!manager.capture_now().await.unwrap());
    }

    #[tokio::test]
    async fn switch_camera_only_restarts_a_running_camera() {
        let (vision, manager, _rx) = manager(FakeVision::default());

        manager.switch_camera(Some("usb-cam".to_string())).await.unwrap();
        assert_eq!(manager.active_source(), None);
        assert_eq!(manager.camera_device().as_deref(), Some("usb-cam"));

        manager.start(VisualSource::Screen).await.unwrap();
        manager.switch_camera(Some("front".to_string())).await.unwrap();
        assert_eq!(manager.active_source(), Some(VisualSource::Screen));

        manager.start(camera()).await.unwrap();
        manager.switch_camera(Some("back".to_string())).await.unwrap();
        assert_eq!(
            manager.active_source(),
            Some(VisualSource::Camera {
                device_id: Some("back".to_string())
            })
        );
        assert_eq!(
            *vision.opened.lock().unwrap(),
            vec!["screen", "camera:front", "camera:back"]
        );
    }
}
