//! Microphone capture manager
//!
//! Acquires a 16 kHz mono input through an [`AudioInputBackend`], buffers the
//! delivered samples and, once per flush interval, encodes everything buffered
//! so far into one base64 PCM16LE chunk.

use crate::device::{AudioInputBackend, CaptureError, DeviceStream, SampleSink};
use crate::events::CaptureEvent;
use crate::sample_codec::{encode_chunk, CAPTURE_SAMPLE_RATE};
use crate::util::lock;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often buffered microphone audio is flushed
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Acquiring,
    Active,
}

struct Inner {
    /// Bumped by every start and stop; stale timers and acquisitions compare against it
    generation: u64,
    phase: Phase,
    device_id: Option<String>,
    buffer: Vec<f32>,
    stream: Option<Box<dyn DeviceStream>>,
    timer: Option<JoinHandle<()>>,
}

/// Owns the microphone stream and its flush timer.
pub struct AudioCaptureManager {
    backend: Arc<dyn AudioInputBackend>,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    flush_interval: Duration,
}

impl AudioCaptureManager {
    pub fn new(
        backend: Arc<dyn AudioInputBackend>,
        device_id: Option<String>,
        events_tx: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(Inner {
                generation: 0,
                phase: Phase::Idle,
                device_id,
                buffer: Vec::new(),
                stream: None,
                timer: None,
            })),
            events_tx,
            flush_interval: FLUSH_INTERVAL,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).phase == Phase::Active
    }

    /// Device the next `start` will open; `None` is the system default.
    pub fn device_id(&self) -> Option<String> {
        lock(&self.inner).device_id.clone()
    }

    /// Start capturing.
    ///
    /// `Some(id)` replaces the selected device first; `None` keeps the current
    /// selection. Does nothing while already active or acquiring. Returns
    /// `CaptureError::Cancelled` if `stop` or `switch_device` ran while the
    /// device was being opened; the late stream is released.
    pub async fn start(&self, device_id: Option<&str>) -> Result<(), CaptureError> {
        let (generation, target) = {
            let mut inner = lock(&self.inner);
            if let Some(id) = device_id {
                inner.device_id = Some(id.to_string());
            }
            if inner.phase != Phase::Idle {
                debug!("Microphone already {:?}, start ignored", inner.phase);
                return Ok(());
            }
            inner.generation += 1;
            inner.phase = Phase::Acquiring;
            inner.buffer.clear();
            (inner.generation, inner.device_id.clone())
        };

        info!(
            "Opening microphone {}",
            target.as_deref().unwrap_or("(default)")
        );
        let sink = sample_sink(Arc::downgrade(&self.inner), generation);
        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || {
            backend.open(target.as_deref(), CAPTURE_SAMPLE_RATE, sink)
        })
        .await
        .unwrap_or_else(|e| Err(CaptureError::Backend(format!("device task failed: {}", e))));

        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            drop(inner);
            if let Ok(mut stream) = opened {
                stream.stop();
            }
            debug!("Microphone acquisition superseded, stream released");
            return Err(CaptureError::Cancelled);
        }

        match opened {
            Ok(stream) => {
                inner.stream = Some(stream);
                inner.phase = Phase::Active;
                inner.timer = Some(self.spawn_flush_timer(generation));
                info!("Microphone capture started");
                Ok(())
            }
            Err(e) => {
                inner.phase = Phase::Idle;
                warn!("Microphone unavailable: {}", e);
                Err(e)
            }
        }
    }

    /// Stop capturing and discard buffered samples. Safe when never started.
    pub fn stop(&self) {
        let (stream, timer, was) = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            let was = inner.phase;
            inner.phase = Phase::Idle;
            inner.buffer.clear();
            (inner.stream.take(), inner.timer.take(), was)
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(mut stream) = stream {
            stream.stop();
        }
        if was != Phase::Idle {
            info!("Microphone capture stopped");
        }
    }

    /// Select another microphone, restarting capture if it was running.
    pub async fn switch_device(&self, device_id: Option<String>) -> Result<(), CaptureError> {
        let was_running = {
            let mut inner = lock(&self.inner);
            inner.device_id = device_id;
            inner.phase != Phase::Idle
        };
        if !was_running {
            return Ok(());
        }

        self.stop();
        self.start(None).await
    }

    /// Flush the buffer immediately. Returns whether a chunk was emitted.
    pub fn flush_now(&self) -> bool {
        let generation = {
            let inner = lock(&self.inner);
            if inner.phase != Phase::Active {
                return false;
            }
            inner.generation
        };
        flush(&self.inner, generation, &self.events_tx) == Flush::Emitted
    }

    fn spawn_flush_timer(&self, generation: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let events_tx = self.events_tx.clone();
        let period = self.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if flush(&inner, generation, &events_tx) == Flush::Stale {
                    break;
                }
            }
        })
    }
}

impl Drop for AudioCaptureManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flush {
    Emitted,
    Empty,
    Stale,
}

fn flush(
    inner: &Mutex<Inner>,
    generation: u64,
    events_tx: &mpsc::UnboundedSender<CaptureEvent>,
) -> Flush {
    // Held through the send so no chunk is queued after a stop returns
    let mut inner = lock(inner);
    if inner.generation != generation {
        return Flush::Stale;
    }
    if inner.buffer.is_empty() {
        return Flush::Empty;
    }
    let samples = std::mem::take(&mut inner.buffer);

    let chunk = encode_chunk(&samples);
    debug!(
        "Flushing {} mic samples ({} base64 chars)",
        samples.len(),
        chunk.len()
    );
    if events_tx.send(CaptureEvent::AudioChunk(chunk)).is_err() {
        return Flush::Stale;
    }
    Flush::Emitted
}

fn sample_sink(inner: Weak<Mutex<Inner>>, generation: u64) -> SampleSink {
    Arc::new(move |samples: &[f32]| {
        if let Some(inner) = inner.upgrade() {
            let mut inner = lock(&inner);
            if inner.generation == generation {
                inner.buffer.extend_from_slice(samples);
            }
        }
    })
}
