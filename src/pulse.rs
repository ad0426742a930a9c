//! PulseAudio microphone and speaker backends
//!
//! Both directions use the simple API on a dedicated OS thread: capture reads
//! 100 ms blocks of mono f32 and hands them to the sample sink, playback
//! drains the shared queue in 20 ms blocks. Without the `pulse` feature the
//! backends report that audio support is not compiled in.

use crate::audio_playback::{AudioOutputBackend, OutputPipeline, PlaybackError, SharedQueue};
use crate::device::{AudioInputBackend, CaptureError, DeviceStream, SampleSink};

#[cfg(feature = "pulse")]
use crate::util::lock;
#[cfg(feature = "pulse")]
use libpulse_binding::sample::{Format, Spec};
#[cfg(feature = "pulse")]
use libpulse_binding::stream::Direction;
#[cfg(feature = "pulse")]
use libpulse_simple_binding::Simple;
#[cfg(feature = "pulse")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "pulse")]
use std::sync::{mpsc, Arc};
#[cfg(feature = "pulse")]
use std::thread::JoinHandle;
#[cfg(feature = "pulse")]
use tracing::{debug, error, info};

/// Application name reported to the sound server
pub const APP_NAME: &str = "live-agent";

/// Microphone capture through PulseAudio
#[derive(Debug, Clone)]
pub struct PulseInput {
    app_name: String,
}

impl Default for PulseInput {
    fn default() -> Self {
        Self::new(APP_NAME)
    }
}

impl PulseInput {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

/// Speaker output through PulseAudio
#[derive(Debug, Clone)]
pub struct PulseOutput {
    app_name: String,
}

impl Default for PulseOutput {
    fn default() -> Self {
        Self::new(APP_NAME)
    }
}

impl PulseOutput {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

#[cfg(not(feature = "pulse"))]
impl AudioInputBackend for PulseInput {
    fn open(
        &self,
        _device_id: Option<&str>,
        _sample_rate: u32,
        _sink: SampleSink,
    ) -> Result<Box<dyn DeviceStream>, CaptureError> {
        Err(CaptureError::Unsupported("PulseAudio capture"))
    }
}

#[cfg(not(feature = "pulse"))]
impl AudioOutputBackend for PulseOutput {
    fn open(
        &self,
        _sample_rate: u32,
        _queue: SharedQueue,
    ) -> Result<Box<dyn OutputPipeline>, PlaybackError> {
        Err(PlaybackError::Device(
            "PulseAudio playback support not compiled in".to_string(),
        ))
    }
}

#[cfg(feature = "pulse")]
fn capture_error(err: libpulse_binding::error::PAErr, device: Option<&str>) -> CaptureError {
    let msg = format!("{}", err);
    let name = device.unwrap_or("default source");
    if msg.to_ascii_lowercase().contains("access denied") {
        CaptureError::PermissionDenied(format!("{}: {}", name, msg))
    } else {
        CaptureError::DeviceUnavailable(format!("{}: {}", name, msg))
    }
}

/// Running capture thread
#[cfg(feature = "pulse")]
struct PulseStream {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[cfg(feature = "pulse")]
impl DeviceStream for PulseStream {
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // the thread notices the flag after its current 100 ms read
            if handle.join().is_err() {
                error!("PulseAudio capture thread panicked");
            }
        }
    }
}

#[cfg(feature = "pulse")]
impl Drop for PulseStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "pulse")]
impl AudioInputBackend for PulseInput {
    fn open(
        &self,
        device_id: Option<&str>,
        sample_rate: u32,
        sink: SampleSink,
    ) -> Result<Box<dyn DeviceStream>, CaptureError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let app_name = self.app_name.clone();
        let device = device_id.map(str::to_string);
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("pulse-capture".to_string())
            .spawn(move || record_loop(app_name, device, sample_rate, sink, flag, ready_tx))
            .map_err(|e| CaptureError::Backend(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(PulseStream {
                shutdown,
                handle: Some(handle),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Backend("capture thread exited during setup".to_string()))
            }
        }
    }
}

#[cfg(feature = "pulse")]
fn record_loop(
    app_name: String,
    device: Option<String>,
    rate: u32,
    sink: SampleSink,
    shutdown: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), CaptureError>>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate,
    };
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Record,
        device.as_deref(),
        "microphone",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => simple,
        Err(e) => {
            let _ = ready_tx.send(Err(capture_error(e, device.as_deref())));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    info!(
        "PulseAudio recording from {} at {} Hz",
        device.as_deref().unwrap_or("default source"),
        rate
    );

    let frames = (rate / 10) as usize;
    let mut bytes = vec![0u8; frames * 4];
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut bytes) {
            error!("PulseAudio read error: {}", e);
            break;
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        sink(&samples);
    }
    debug!("PulseAudio capture thread exiting");
}

/// Samples written per playback block (20 ms at 24 kHz)
#[cfg(feature = "pulse")]
const PLAYBACK_BLOCK: usize = 480;

#[cfg(feature = "pulse")]
struct PulsePlayback {
    app_name: String,
    rate: u32,
    queue: SharedQueue,
    shutdown: Arc<AtomicBool>,
    /// Cleared by the thread when the server connection fails
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[cfg(feature = "pulse")]
impl PulsePlayback {
    fn spawn(&mut self) -> Result<(), PlaybackError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        self.shutdown = Arc::new(AtomicBool::new(false));
        self.running = Arc::new(AtomicBool::new(true));

        let app_name = self.app_name.clone();
        let rate = self.rate;
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("pulse-playback".to_string())
            .spawn(move || playback_loop(app_name, rate, queue, shutdown, running, ready_tx))
            .map_err(|e| PlaybackError::Device(format!("failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(PlaybackError::Device("playback thread exited during setup".to_string()))
            }
        }
    }
}

#[cfg(feature = "pulse")]
impl OutputPipeline for PulsePlayback {
    fn is_suspended(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        self.stop();
        self.spawn()
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("PulseAudio playback thread panicked");
            }
        }
    }
}

#[cfg(feature = "pulse")]
impl Drop for PulsePlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "pulse")]
impl AudioOutputBackend for PulseOutput {
    fn open(
        &self,
        sample_rate: u32,
        queue: SharedQueue,
    ) -> Result<Box<dyn OutputPipeline>, PlaybackError> {
        let mut playback = PulsePlayback {
            app_name: self.app_name.clone(),
            rate: sample_rate,
            queue,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        };
        playback.spawn()?;
        Ok(Box::new(playback))
    }
}

#[cfg(feature = "pulse")]
fn playback_loop(
    app_name: String,
    rate: u32,
    queue: SharedQueue,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), PlaybackError>>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate,
    };
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Playback,
        None,
        "model speech",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => simple,
        Err(e) => {
            running.store(false, Ordering::Relaxed);
            let _ = ready_tx.send(Err(PlaybackError::Device(format!("{}", e))));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut block = vec![0.0f32; PLAYBACK_BLOCK];
    let mut bytes = Vec::with_capacity(PLAYBACK_BLOCK * 4);
    while !shutdown.load(Ordering::Relaxed) {
        lock(&queue).fill(&mut block);
        bytes.clear();
        bytes.extend(block.iter().flat_map(|s| s.to_le_bytes()));
        if let Err(e) = simple.write(&bytes) {
            error!("PulseAudio write error: {}", e);
            break;
        }
    }

    if !shutdown.load(Ordering::Relaxed) {
        running.store(false, Ordering::Relaxed);
    } else if let Err(e) = simple.drain() {
        debug!("PulseAudio drain failed: {}", e);
    }
    debug!("PulseAudio playback thread exiting");
}

#[cfg(all(test, not(feature = "pulse")))]
mod tests {
    use super::*;
    use crate::audio_playback::SampleQueue;
    use std::sync::{Arc, Mutex};

    #[test]
    fn backends_report_missing_support() {
        let sink: SampleSink = Arc::new(|_: &[f32]| {});
        assert!(matches!(
            PulseInput::default().open(None, 16_000, sink),
            Err(CaptureError::Unsupported(_))
        ));

        let queue = Arc::new(Mutex::new(SampleQueue::with_capacity(16)));
        assert!(matches!(
            PulseOutput::default().open(24_000, queue),
            Err(PlaybackError::Device(_))
        ));
    }
}
