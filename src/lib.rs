//! live-agent - real-time multimedia streaming client
//!
//! Streams microphone audio, camera or screen stills and text to a live
//! multimodal model service over a websocket proxy, and plays back the audio
//! and text the model sends in return.

#![forbid(unsafe_code)]

pub mod audio_capture;
pub mod audio_playback;
/// Camera surfaces (enabled with the "capture" feature)
pub mod camera;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod events;
pub mod frame_codec;
pub mod live_client;
pub mod protocol;
/// PulseAudio backends (enabled with the "pulse" feature)
pub mod pulse;
pub mod sample_codec;
/// Screen surfaces (enabled with the "capture" feature)
pub mod screen;
pub mod util;
pub mod visual_capture;

pub use config::{ConfigError, SessionConfig};
pub use coordinator::{Backends, Command, SessionCoordinator, Toggles};
pub use events::{SessionEvent, SessionStatus};
pub use live_client::{LiveClient, LiveError};
