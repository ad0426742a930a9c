//! Live session wire protocol
//!
//! JSON frames exchanged with the websocket proxy in front of the live model
//! service. Outbound frames are strongly typed; inbound frames are classified
//! structurally because the service does not send an explicit type tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseModality {
    #[serde(rename = "AUDIO")]
    Audio,
    #[serde(rename = "TEXT")]
    Text,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Text => "TEXT",
        }
    }
}

impl fmt::Display for ResponseModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseModality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUDIO" => Ok(Self::Audio),
            "TEXT" => Ok(Self::Text),
            other => Err(format!("unknown response modality '{}'", other)),
        }
    }
}

/// MIME type of a realtime media chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    #[serde(rename = "audio/pcm")]
    AudioPcm,
    #[serde(rename = "image/jpeg")]
    ImageJpeg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
}

/// Session setup payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub mime_type: MimeType,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Message sent from client to the proxy.
///
/// `ServiceSetup` and `SessionSetup` must be the first two frames on a socket,
/// in that order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    ServiceSetup {
        bearer_token: String,
        service_url: String,
    },
    SessionSetup {
        setup: SessionSetup,
    },
    TextTurn {
        client_content: ClientContent,
    },
    MediaChunk {
        realtime_input: RealtimeInput,
    },
}

impl OutboundMessage {
    pub fn service_setup(bearer_token: &str, service_url: &str) -> Self {
        Self::ServiceSetup {
            bearer_token: bearer_token.to_string(),
            service_url: service_url.to_string(),
        }
    }

    pub fn session_setup(
        model_uri: &str,
        response_modalities: &[ResponseModality],
        system_instruction: &str,
    ) -> Self {
        Self::SessionSetup {
            setup: SessionSetup {
                model: model_uri.to_string(),
                generation_config: GenerationConfig {
                    response_modalities: response_modalities.to_vec(),
                },
                system_instruction: Content {
                    parts: vec![Part {
                        text: system_instruction.to_string(),
                    }],
                },
            },
        }
    }

    pub fn text_turn(text: &str) -> Self {
        Self::TextTurn {
            client_content: ClientContent {
                turns: vec![Turn {
                    role: "user".to_string(),
                    parts: vec![Part {
                        text: text.to_string(),
                    }],
                }],
                turn_complete: true,
            },
        }
    }

    pub fn media_chunk(mime_type: MimeType, data: String) -> Self {
        Self::MediaChunk {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk { mime_type, data }],
            },
        }
    }

    /// Whether this is one of the two handshake frames.
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::ServiceSetup { .. } | Self::SessionSetup { .. })
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceSetup { .. } => "service_setup",
            Self::SessionSetup { .. } => "session_setup",
            Self::TextTurn { .. } => "text_turn",
            Self::MediaChunk { realtime_input } => match realtime_input.media_chunks.first() {
                Some(MediaChunk { mime_type: MimeType::AudioPcm, .. }) => "audio_chunk",
                Some(MediaChunk { mime_type: MimeType::ImageJpeg, .. }) => "image_chunk",
                None => "media_chunk",
            },
        }
    }
}

/// Classified content of an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    SetupComplete,
    Text(String),
    /// Base64 PCM16LE at 24 kHz
    Audio(String),
    Unknown,
}

/// Inbound frame after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub kind: InboundKind,
    /// The model finished its turn with this frame
    pub end_of_turn: bool,
}

/// Look up `camel` or, failing that, `snake` in a JSON object.
fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value
        .get(camel)
        .or_else(|| value.get(snake))
        .filter(|v| !v.is_null())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl InboundMessage {
    /// Classify a parsed frame.
    ///
    /// Precedence: setup acknowledgement, then text in the first model part,
    /// then inline data in the first model part, then unknown. The end-of-turn
    /// flag is read independently of the content.
    pub fn classify(frame: &Value) -> Self {
        let server_content = field(frame, "serverContent", "server_content");

        let end_of_turn = server_content
            .and_then(|sc| field(sc, "turnComplete", "turn_complete"))
            .or_else(|| field(frame, "turnComplete", "turn_complete"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let first_part = server_content
            .and_then(|sc| field(sc, "modelTurn", "model_turn"))
            .and_then(|turn| turn.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first());

        let kind = if field(frame, "setupComplete", "setup_complete").is_some_and(is_truthy) {
            InboundKind::SetupComplete
        } else if let Some(text) = first_part
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            InboundKind::Text(text.to_string())
        } else if let Some(inline) = first_part.and_then(|p| field(p, "inlineData", "inline_data")) {
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            InboundKind::Audio(data.to_string())
        } else {
            InboundKind::Unknown
        };

        Self { kind, end_of_turn }
    }

    /// Parse and classify a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let frame: Value = serde_json::from_str(raw)?;
        Ok(Self::classify(&frame))
    }
}
