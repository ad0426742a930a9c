//! Model audio playback
//!
//! Decoded 24 kHz samples are appended to a bounded queue that the output
//! device drains. The output pipeline is created on first use. Opening and
//! resuming it can block on the sound server, so both run on the blocking pool.

use crate::sample_codec::{decode_chunk, PLAYBACK_SAMPLE_RATE};
use crate::util::lock;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Upper bound on queued model audio
pub const MAX_QUEUED_SECONDS: usize = 30;

/// Error type for audio output
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio output unavailable: {0}")]
    Device(String),
}

/// FIFO of pending output samples. Overflow drops the oldest samples.
#[derive(Debug)]
pub struct SampleQueue {
    samples: VecDeque<f32>,
    capacity: usize,
    dropped: u64,
}

impl SampleQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(PLAYBACK_SAMPLE_RATE as usize)),
            capacity,
            dropped: 0,
        }
    }

    /// Append samples, evicting from the front when full. Returns how many
    /// samples were evicted.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        // Only the newest `capacity` samples of the input can survive
        let incoming = &samples[samples.len().saturating_sub(self.capacity)..];
        let mut evicted = samples.len() - incoming.len();

        let overflow = (self.samples.len() + incoming.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.samples.drain(..overflow);
            evicted += overflow;
        }
        self.samples.extend(incoming.iter().copied());

        self.dropped += evicted as u64;
        evicted
    }

    /// Fill `out` from the front of the queue, padding with silence.
    /// Returns the number of real samples written.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.samples.len());
        for (dst, src) in out.iter_mut().zip(self.samples.drain(..n)) {
            *dst = src;
        }
        out[n..].fill(0.0);
        n
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Total samples evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub type SharedQueue = Arc<Mutex<SampleQueue>>;

/// A running output pipeline draining a [`SharedQueue`].
///
/// `resume` and `stop` may block; the manager calls them off the runtime.
pub trait OutputPipeline: Send {
    fn is_suspended(&self) -> bool;

    fn resume(&mut self) -> Result<(), PlaybackError>;

    /// Release the output device. Must be idempotent.
    fn stop(&mut self);
}

/// Opens output pipelines.
pub trait AudioOutputBackend: Send + Sync {
    fn open(&self, sample_rate: u32, queue: SharedQueue)
        -> Result<Box<dyn OutputPipeline>, PlaybackError>;
}

type PipelineSlot = Option<Box<dyn OutputPipeline>>;

/// Plays base64 PCM16LE chunks received from the model.
pub struct AudioPlaybackManager {
    backend: Arc<dyn AudioOutputBackend>,
    queue: SharedQueue,
    // async mutex: held while the pipeline opens on the blocking pool
    pipeline: tokio::sync::Mutex<PipelineSlot>,
}

impl AudioPlaybackManager {
    pub fn new(backend: Arc<dyn AudioOutputBackend>) -> Self {
        let capacity = PLAYBACK_SAMPLE_RATE as usize * MAX_QUEUED_SECONDS;
        Self {
            backend,
            queue: Arc::new(Mutex::new(SampleQueue::with_capacity(capacity))),
            pipeline: tokio::sync::Mutex::new(None),
        }
    }

    /// Decode one chunk and queue it for playback.
    ///
    /// Opens (or resumes) the output pipeline on first use. A chunk that fails
    /// to decode is logged and dropped; only device failures are returned.
    pub async fn play_chunk(&self, base64_pcm: &str) -> Result<(), PlaybackError> {
        self.ensure_pipeline().await?;

        let samples = match decode_chunk(base64_pcm) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping undecodable audio chunk: {}", e);
                return Ok(());
            }
        };

        let evicted = lock(&self.queue).push(&samples);
        if evicted > 0 {
            warn!("Playback queue full, dropped {} oldest samples", evicted);
        }
        debug!("Queued {} playback samples", samples.len());
        Ok(())
    }

    /// Drop all queued audio.
    pub fn clear(&self) {
        lock(&self.queue).clear();
    }

    /// Samples still waiting for the output device. Zero once playback drained.
    pub fn queued_samples(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Release the output pipeline. The next chunk reopens it.
    pub async fn shutdown(&self) {
        self.clear();
        let pipeline = self.pipeline.lock().await.take();
        if let Some(mut pipeline) = pipeline {
            let stopped = tokio::task::spawn_blocking(move || pipeline.stop()).await;
            if let Err(e) = stopped {
                warn!("Audio output stop task failed: {}", e);
            }
            info!("Audio output released");
        }
    }

    async fn ensure_pipeline(&self) -> Result<(), PlaybackError> {
        let mut slot = self.pipeline.lock().await;
        if let Some(pipeline) = slot.as_ref() {
            if !pipeline.is_suspended() {
                return Ok(());
            }
        }

        let current = slot.take();
        let backend = self.backend.clone();
        let queue = self.queue.clone();
        let (pipeline, result) = tokio::task::spawn_blocking(move || match current {
            Some(mut pipeline) => {
                debug!("Resuming suspended audio output");
                let resumed = pipeline.resume();
                (Some(pipeline), resumed)
            }
            None => match backend.open(PLAYBACK_SAMPLE_RATE, queue) {
                Ok(pipeline) => {
                    info!("Audio output opened at {} Hz", PLAYBACK_SAMPLE_RATE);
                    (Some(pipeline), Ok(()))
                }
                Err(e) => (None, Err(e)),
            },
        })
        .await
        .map_err(|e| PlaybackError::Device(format!("output task failed: {}", e)))?;

        *slot = pipeline;
        result
    }
}

impl Drop for AudioPlaybackManager {
    fn drop(&mut self) {
        if let Some(mut pipeline) = self.pipeline.get_mut().take() {
            pipeline.stop();
        }
    }
}
