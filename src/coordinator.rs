//! Session coordinator
//!
//! Owns the live client and the three media managers, and is the single place
//! where session state changes. Everything arrives as an event on one loop:
//! UI commands, encoded media from the capture managers, and inbound traffic
//! from the client. Handlers run to completion one at a time.

use crate::audio_capture::AudioCaptureManager;
use crate::audio_playback::{AudioOutputBackend, AudioPlaybackManager};
use crate::config::SessionConfig;
use crate::device::{AudioInputBackend, CaptureError, NativeVisual, VisualBackend};
use crate::events::{CaptureEvent, ClientEvent, ConnectionEvent, SessionEvent, SessionStatus};
use crate::live_client::{LiveClient, LiveError};
use crate::protocol::{InboundKind, InboundMessage};
use crate::pulse::{PulseInput, PulseOutput};
use crate::util::preview;
use crate::visual_capture::{VisualCaptureManager, VisualKind, VisualSource};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Capacity of the observer event channel
const EVENT_CAPACITY: usize = 256;

/// How often `speaking` is checked against the playback queue
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Device backends used by the media managers
#[derive(Clone)]
pub struct Backends {
    pub audio_input: Arc<dyn AudioInputBackend>,
    pub audio_output: Arc<dyn AudioOutputBackend>,
    pub visual: Arc<dyn VisualBackend>,
}

impl Backends {
    /// PulseAudio for sound, nokhwa and xcap for video.
    pub fn native() -> Self {
        Self {
            audio_input: Arc::new(PulseInput::default()),
            audio_output: Arc::new(PulseOutput::default()),
            visual: Arc::new(NativeVisual),
        }
    }
}

/// Requests from the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    SetMicrophone(bool),
    SwitchMicrophone(Option<String>),
    SetCamera(bool),
    SwitchCamera(Option<String>),
    SetScreen(bool),
    SendText(String),
    Shutdown,
}

/// What the user asked to have enabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Toggles {
    pub microphone: bool,
    pub camera: bool,
    pub screen: bool,
}

pub struct SessionCoordinator {
    config: SessionConfig,
    client: LiveClient,
    audio_capture: AudioCaptureManager,
    playback: AudioPlaybackManager,
    visual: VisualCaptureManager,
    toggles: Toggles,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    client_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig, backends: Backends) -> Self {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let client = LiveClient::new(config.client_config(), client_tx);
        let audio_capture = AudioCaptureManager::new(
            backends.audio_input,
            config.devices.microphone.clone(),
            capture_tx.clone(),
        );
        let visual = VisualCaptureManager::new(
            backends.visual,
            config.devices.camera.clone(),
            capture_tx,
        );
        let playback = AudioPlaybackManager::new(backends.audio_output);

        Self {
            config,
            client,
            audio_capture,
            playback,
            visual,
            toggles: Toggles::default(),
            capture_rx,
            client_rx,
            status_tx,
            events_tx,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn toggles(&self) -> Toggles {
        self.toggles
    }

    /// Observe status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Receive text, turn and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Process commands, media and inbound traffic until `Shutdown` or until
    /// the command channel closes, then release every device.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Session coordinator started");
        let mut drain_check = tokio::time::interval(DRAIN_CHECK_INTERVAL);
        drain_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = self.client_rx.recv() => self.handle_client_event(event).await,
                Some(event) = self.capture_rx.recv() => self.handle_capture_event(event).await,
                _ = drain_check.tick() => self.check_playback_drained(),
            }
        }
        self.shutdown().await;
        info!("Session coordinator stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        debug!("Command: {:?}", cmd);
        // Failures are already published as SessionEvent::Error
        let _ = match cmd {
            Command::Connect => self.connect().await.map_err(|_| ()),
            Command::Disconnect => {
                self.disconnect().await;
                Ok(())
            }
            Command::SetMicrophone(on) => self.set_microphone(on).await.map_err(|_| ()),
            Command::SwitchMicrophone(id) => self.switch_microphone(id).await.map_err(|_| ()),
            Command::SetCamera(on) => self.set_camera(on).await.map_err(|_| ()),
            Command::SwitchCamera(id) => self.switch_camera(id).await.map_err(|_| ()),
            Command::SetScreen(on) => self.set_screen(on).await.map_err(|_| ()),
            Command::SendText(text) => self.send_text(&text).await.map_err(|_| ()),
            Command::Shutdown => Ok(()),
        };
    }

    /// Open the live session. Only acts while disconnected.
    pub async fn connect(&mut self) -> Result<(), LiveError> {
        if self.status() != SessionStatus::Disconnected {
            debug!("connect() ignored while {}", self.status().as_str());
            return Ok(());
        }

        self.set_status(SessionStatus::Connecting);
        if let Err(e) = self.client.connect(&self.config.bearer_token).await {
            error!("Connection failed: {}", e);
            self.set_status(SessionStatus::Disconnected);
            self.emit(SessionEvent::Error(format!("Connection failed: {}", e)));
            return Err(e);
        }
        self.set_status(SessionStatus::Connected);

        if self.toggles.microphone {
            if let Err(e) = self.audio_capture.start(None).await {
                self.microphone_failed(e);
            }
        }
        Ok(())
    }

    /// Close the session and release every device. Only acts while not
    /// already disconnected.
    pub async fn disconnect(&mut self) {
        if self.status() == SessionStatus::Disconnected {
            return;
        }
        self.teardown().await;
    }

    /// Enable or disable the microphone. While disconnected this only
    /// records the choice for the next connect.
    pub async fn set_microphone(&mut self, on: bool) -> Result<(), CaptureError> {
        self.toggles.microphone = on;
        if !on {
            self.audio_capture.stop();
            return Ok(());
        }
        if !self.status().is_live() {
            debug!("Microphone enabled, starts on connect");
            return Ok(());
        }

        self.audio_capture.start(None).await.map_err(|e| {
            self.microphone_failed(e.clone());
            e
        })
    }

    pub async fn switch_microphone(&mut self, device_id: Option<String>) -> Result<(), CaptureError> {
        self.audio_capture.switch_device(device_id).await.map_err(|e| {
            self.microphone_failed(e.clone());
            e
        })
    }

    /// Enable or disable the camera. Enabling it turns screen sharing off.
    pub async fn set_camera(&mut self, on: bool) -> Result<(), CaptureError> {
        self.set_visual(VisualKind::Camera, on).await
    }

    /// Enable or disable screen sharing. Enabling it turns the camera off.
    pub async fn set_screen(&mut self, on: bool) -> Result<(), CaptureError> {
        self.set_visual(VisualKind::Screen, on).await
    }

    pub async fn switch_camera(&mut self, device_id: Option<String>) -> Result<(), CaptureError> {
        self.visual.switch_camera(device_id).await.map_err(|e| {
            self.toggles.camera = false;
            self.visual_failed(VisualKind::Camera, &e);
            e
        })
    }

    /// Send a user text turn. Blank text is ignored.
    pub async fn send_text(&mut self, text: &str) -> Result<(), LiveError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        if !self.status().is_live() {
            warn!("Dropping text while {}", self.status().as_str());
            return Err(LiveError::NotConnected);
        }
        info!("Sending text turn: {}", preview(text, 100));
        self.client.send_text(text).await
    }

    async fn set_visual(&mut self, kind: VisualKind, on: bool) -> Result<(), CaptureError> {
        let enabled = match kind {
            VisualKind::Camera => self.toggles.camera,
            VisualKind::Screen => self.toggles.screen,
        };
        if !on {
            if enabled {
                self.visual.stop();
            }
            self.set_visual_toggle(kind, false);
            return Ok(());
        }

        self.toggles.camera = kind == VisualKind::Camera;
        self.toggles.screen = kind == VisualKind::Screen;
        let source = match kind {
            VisualKind::Camera => VisualSource::Camera { device_id: None },
            VisualKind::Screen => VisualSource::Screen,
        };

        self.visual.start(source).await.map_err(|e| {
            self.set_visual_toggle(kind, false);
            self.visual_failed(kind, &e);
            e
        })
    }

    fn set_visual_toggle(&mut self, kind: VisualKind, on: bool) {
        match kind {
            VisualKind::Camera => self.toggles.camera = on,
            VisualKind::Screen => self.toggles.screen = on,
        }
    }

    fn microphone_failed(&mut self, e: CaptureError) {
        self.toggles.microphone = false;
        if e != CaptureError::Cancelled {
            self.emit(SessionEvent::Error(format!("Microphone: {}", e)));
        }
    }

    fn visual_failed(&self, kind: VisualKind, e: &CaptureError) {
        if *e != CaptureError::Cancelled {
            self.emit(SessionEvent::Error(format!("{:?}: {}", kind, e)));
        }
    }

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        if !self.status().is_live() {
            debug!("Dropping captured media while {}", self.status().as_str());
            return;
        }

        let sent = match event {
            CaptureEvent::AudioChunk(data) => self.client.send_audio(data).await,
            CaptureEvent::VideoFrame(data) => self.client.send_image(data).await,
        };
        // A dead socket is reported separately by the reader task
        if let Err(e) = sent {
            warn!("Failed to forward media: {}", e);
        }
    }

    async fn handle_client_event(&mut self, stamped: ConnectionEvent) {
        if stamped.connection != self.client.connection() {
            debug!("Ignoring event from closed connection {}", stamped.connection);
            return;
        }

        match stamped.event {
            ClientEvent::Message(msg) => self.handle_inbound(msg).await,
            ClientEvent::Closed => {
                if self.status() != SessionStatus::Disconnected {
                    info!("Server closed the session");
                    self.teardown().await;
                }
            }
            ClientEvent::Error(reason) => {
                if self.status() != SessionStatus::Disconnected {
                    error!("Session error: {}", reason);
                    self.teardown().await;
                    self.emit(SessionEvent::Error(reason));
                }
            }
        }
    }

    async fn handle_inbound(&mut self, msg: InboundMessage) {
        if !self.status().is_live() {
            debug!("Ignoring inbound message while {}", self.status().as_str());
            return;
        }

        match msg.kind {
            InboundKind::SetupComplete => {
                info!("Session setup complete");
                self.emit(SessionEvent::SetupComplete);
            }
            InboundKind::Text(content) => {
                debug!("Model text: {}", preview(&content, 100));
                self.emit(SessionEvent::Text {
                    content,
                    end_of_turn: msg.end_of_turn,
                });
            }
            InboundKind::Audio(data) => match self.playback.play_chunk(&data).await {
                Ok(()) if self.playback.queued_samples() > 0 => {
                    self.set_status(SessionStatus::Speaking)
                }
                Ok(()) => {}
                Err(e) => warn!("Model audio not played: {}", e),
            },
            InboundKind::Unknown => {}
        }

        if msg.end_of_turn {
            self.set_status(SessionStatus::Connected);
            self.emit(SessionEvent::TurnComplete);
        }
    }

    /// Back to `connected` once the output queue has run dry.
    fn check_playback_drained(&mut self) {
        if self.status() == SessionStatus::Speaking && self.playback.queued_samples() == 0 {
            debug!("Playback queue drained");
            self.set_status(SessionStatus::Connected);
        }
    }

    async fn teardown(&mut self) {
        self.audio_capture.stop();
        self.visual.stop();
        self.playback.clear();
        self.client.disconnect().await;
        self.toggles = Toggles::default();

        // Anything still queued belongs to the session that just ended
        let mut stale = 0;
        while self.capture_rx.try_recv().is_ok() {
            stale += 1;
        }
        while self.client_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} queued events from the closed session", stale);
        }

        self.set_status(SessionStatus::Disconnected);
    }

    async fn shutdown(&mut self) {
        self.teardown().await;
        self.playback.shutdown().await;
    }

    fn set_status(&self, status: SessionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!("Session status: {}", status.as_str());
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}
