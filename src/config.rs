//! Session configuration
//!
//! Everything the session needs from the environment is gathered here once
//! and handed to the coordinator at construction time.

use crate::live_client::ClientConfig;
use crate::protocol::ResponseModality;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-live-preview-04-09";
pub const DEFAULT_API_HOST: &str = "us-central1-aiplatform.googleapis.com";
pub const DEFAULT_LOCATION: &str = "us-central1";

/// Error type for configuration loading
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Selected capture devices; `None` means the system default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    pub microphone: Option<String>,
    pub camera: Option<String>,
}

/// Configuration for one live session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Websocket endpoint the client connects to
    pub proxy_url: String,
    pub bearer_token: String,
    pub project_id: String,
    pub model: String,
    pub api_host: String,
    pub location: String,
    pub response_modalities: Vec<ResponseModality>,
    pub system_instructions: String,
    pub devices: DeviceSelection,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            proxy_url: String::new(),
            bearer_token: String::new(),
            project_id: String::new(),
            model: DEFAULT_MODEL.to_string(),
            api_host: DEFAULT_API_HOST.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            response_modalities: vec![ResponseModality::Audio],
            system_instructions: String::new(),
            devices: DeviceSelection::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Load configuration from `LIVE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let mut config = Self {
            proxy_url: required("LIVE_PROXY_URL")?,
            bearer_token: required("LIVE_BEARER_TOKEN")?,
            project_id: required("LIVE_PROJECT_ID")?,
            ..Self::default()
        };

        if let Some(model) = lookup("LIVE_MODEL") {
            config.model = model;
        }
        if let Some(host) = lookup("LIVE_API_HOST") {
            config.api_host = host;
        }
        if let Some(location) = lookup("LIVE_LOCATION") {
            config.location = location;
        }
        if let Some(list) = lookup("LIVE_RESPONSE_MODALITIES") {
            config.response_modalities = parse_modalities(&list)?;
        }
        if let Some(instructions) = lookup("LIVE_SYSTEM_INSTRUCTIONS") {
            config.system_instructions = instructions;
        }
        config.devices.microphone = lookup("LIVE_MICROPHONE").filter(|v| !v.is_empty());
        config.devices.camera = lookup("LIVE_CAMERA").filter(|v| !v.is_empty());

        Ok(config)
    }

    /// Fully qualified model resource name sent in the session setup.
    pub fn model_uri(&self) -> String {
        format!(
            "projects/{}/locations/{}/publishers/google/models/{}",
            self.project_id, self.location, self.model
        )
    }

    /// URL of the upstream service the proxy forwards to.
    pub fn service_url(&self) -> String {
        format!(
            "wss://{}/ws/google.cloud.aiplatform.v1beta1.LlmBidiService/BidiGenerateContent",
            self.api_host
        )
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.proxy_url.clone(),
            service_url: self.service_url(),
            model_uri: self.model_uri(),
            response_modalities: self.response_modalities.clone(),
            system_instructions: self.system_instructions.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

fn parse_modalities(list: &str) -> Result<Vec<ResponseModality>, ConfigError> {
    let mut modalities = Vec::new();
    for item in list.split(',').filter(|s| !s.trim().is_empty()) {
        let modality = item.parse::<ResponseModality>().map_err(|reason| ConfigError::Invalid {
            var: "LIVE_RESPONSE_MODALITIES",
            reason,
        })?;
        if !modalities.contains(&modality) {
            modalities.push(modality);
        }
    }

    if modalities.is_empty() {
        return Err(ConfigError::Invalid {
            var: "LIVE_RESPONSE_MODALITIES",
            reason: "at least one modality is required".to_string(),
        });
    }
    Ok(modalities)
}
