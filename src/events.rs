//! Event types passed over the channels between components

use crate::protocol::InboundMessage;

/// Encoded media emitted by the capture managers
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One second of 16 kHz mono PCM16LE, base64 encoded
    AudioChunk(String),
    /// JPEG still, base64 encoded without data-URI prefix
    VideoFrame(String),
}

/// Events emitted by the live client's reader task
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A classified inbound frame
    Message(InboundMessage),
    /// The socket closed with code 1000
    Closed,
    /// Abnormal closure or socket error, with a human-readable reason
    Error(String),
}

/// A [`ClientEvent`] tagged with the connection whose reader produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub connection: u64,
    pub event: ClientEvent,
}

/// Observable session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected and model audio is being rendered
    Speaking,
}

impl SessionStatus {
    /// Whether media and text may be sent in this state.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Speaking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Speaking => "speaking",
        }
    }
}

/// Events published by the session coordinator to its subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Model text output
    Text { content: String, end_of_turn: bool },
    /// The model finished its turn
    TurnComplete,
    /// The service acknowledged the session setup
    SetupComplete,
    /// A connection-level or device-level failure
    Error(String),
}
