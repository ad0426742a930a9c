//! Live session websocket client
//!
//! Owns the socket to the live service proxy. The socket is split into a sink,
//! kept by the client for outbound frames, and a stream, drained by a
//! background reader task that classifies every inbound frame and reports it
//! on the client event channel.

use crate::events::{ClientEvent, ConnectionEvent};
use crate::protocol::{InboundMessage, MimeType, OutboundMessage, ResponseModality};
use crate::util::preview;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Socket, Message>;
type WsStream = SplitStream<Socket>;

/// Close code for a normal closure
const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the socket drops without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

/// Error type for live client operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Setup frames are only sent while connecting")]
    SetupOutOfOrder,

    #[error("Timed out connecting to {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Connection parameters for the live client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Websocket URL to open (the proxy)
    pub endpoint: String,
    /// Upstream service URL announced in the first frame
    pub service_url: String,
    pub model_uri: String,
    pub response_modalities: Vec<ResponseModality>,
    pub system_instructions: String,
    pub connect_timeout: Duration,
}

/// Connection state of the live client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    /// Handshake frames written; content frames may follow
    Ready,
}

/// Websocket client for one live session at a time.
pub struct LiveClient {
    config: ClientConfig,
    state: ConnectionState,
    writer: Option<WsSink>,
    /// Bumped whenever a socket is dropped; events carry the value of their socket
    connection: u64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    reader_alive: Arc<AtomicBool>,
    rx_task: Option<JoinHandle<()>>,
}

impl LiveClient {
    /// Create a client that reports inbound traffic on `events_tx`.
    pub fn new(config: ClientConfig, events_tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            writer: None,
            connection: 0,
            events_tx,
            reader_alive: Arc::new(AtomicBool::new(false)),
            rx_task: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replace the connection parameters used by the next `connect`.
    pub fn set_config(&mut self, config: ClientConfig) {
        self.config = config;
    }

    /// Id of the current socket. Events stamped with any other id belong to a
    /// socket that was already replaced or closed.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Whether the handshake was sent and the socket is still open.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Ready && self.reader_alive.load(Ordering::SeqCst)
    }

    /// Open the socket and send the two setup frames.
    ///
    /// Returning `Ok` is the connection-established signal. Calling this while
    /// already connected is a no-op; a dead previous socket is replaced.
    pub async fn connect(&mut self, bearer_token: &str) -> Result<()> {
        if self.is_connected() {
            debug!("connect() ignored, session already open");
            return Ok(());
        }
        self.teardown();

        self.state = ConnectionState::Connecting;
        info!("Connecting to live proxy at {}", self.config.endpoint);

        let (ws_stream, resp) = match tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.endpoint.as_str()),
        )
        .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!("Failed to open websocket: {}", e);
                self.state = ConnectionState::Disconnected;
                return Err(LiveError::WebSocket(e));
            }
            Err(_) => {
                error!("Timed out opening websocket");
                self.state = ConnectionState::Disconnected;
                return Err(LiveError::Timeout(self.config.endpoint.clone()));
            }
        };
        debug!("WebSocket handshake response status: {}", resp.status());

        let (mut sink, stream) = ws_stream.split();

        let handshake = [
            OutboundMessage::service_setup(bearer_token, &self.config.service_url),
            OutboundMessage::session_setup(
                &self.config.model_uri,
                &self.config.response_modalities,
                &self.config.system_instructions,
            ),
        ];
        for msg in &handshake {
            if let Err(e) = write_frame(&mut sink, msg).await {
                error!("Failed to send {} frame: {}", msg.kind(), e);
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        }
        info!("Setup frames sent for model {}", self.config.model_uri);

        let alive = Arc::new(AtomicBool::new(true));
        self.reader_alive = alive.clone();
        self.rx_task = Some(tokio::spawn(read_loop(
            stream,
            self.connection,
            self.events_tx.clone(),
            alive,
        )));
        self.writer = Some(sink);
        self.state = ConnectionState::Ready;

        Ok(())
    }

    /// Serialize and send a content frame.
    pub async fn send(&mut self, msg: &OutboundMessage) -> Result<()> {
        if msg.is_setup() {
            return Err(LiveError::SetupOutOfOrder);
        }
        if !self.is_connected() {
            return Err(LiveError::NotConnected);
        }

        let writer = self.writer.as_mut().ok_or(LiveError::NotConnected)?;
        write_frame(writer, msg).await
    }

    /// Send a complete user text turn.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(&OutboundMessage::text_turn(text)).await
    }

    /// Send one base64 PCM16LE chunk of microphone audio.
    pub async fn send_audio(&mut self, base64_pcm: String) -> Result<()> {
        self.send(&OutboundMessage::media_chunk(MimeType::AudioPcm, base64_pcm))
            .await
    }

    /// Send one base64 JPEG frame.
    pub async fn send_image(&mut self, base64_jpeg: String) -> Result<()> {
        self.send(&OutboundMessage::media_chunk(MimeType::ImageJpeg, base64_jpeg))
            .await
    }

    /// Close the socket with a normal closure code.
    pub async fn disconnect(&mut self) {
        // Stop the reader first so our own close is not reported as an event
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        self.reader_alive.store(false, Ordering::SeqCst);
        self.connection += 1;

        if let Some(mut writer) = self.writer.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(e) = writer.send(close).await {
                debug!("Close frame not delivered: {}", e);
            }
            info!("Live session closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn teardown(&mut self) {
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        self.reader_alive.store(false, Ordering::SeqCst);
        self.connection += 1;
        self.writer = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn write_frame(sink: &mut WsSink, msg: &OutboundMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    debug!("Sending {} frame: {}", msg.kind(), preview(&json, 120));
    sink.send(Message::text(json)).await?;
    Ok(())
}

/// Drain the socket until it closes, reporting classified frames.
async fn read_loop(
    mut stream: WsStream,
    connection: u64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    alive: Arc<AtomicBool>,
) {
    debug!("Inbound reader started for connection {}", connection);
    let report = |event: ClientEvent| {
        let _ = events_tx.send(ConnectionEvent { connection, event });
    };

    let terminal = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => dispatch_frame(text.as_str(), &report),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch_frame(text, &report),
                Err(_) => debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Some(Ok(Message::Close(frame))) => break close_event(frame),
            Some(Ok(_)) => {
                // ping/pong are answered by tungstenite
            }
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break ClientEvent::Error(format!("Connection error: {}", e));
            }
            None => {
                break ClientEvent::Error(format!(
                    "Connection closed abnormally (code {})",
                    ABNORMAL_CLOSURE
                ));
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    if let ClientEvent::Error(reason) = &terminal {
        warn!("Live session ended: {}", reason);
    }
    report(terminal);
    debug!("Inbound reader terminated");
}

fn close_event(frame: Option<CloseFrame>) -> ClientEvent {
    match frame {
        Some(frame) if u16::from(frame.code) == NORMAL_CLOSURE => {
            info!("WebSocket closed normally");
            ClientEvent::Closed
        }
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = frame.reason.as_str().trim();
            if reason.is_empty() {
                ClientEvent::Error(format!("Connection closed (code {})", code))
            } else {
                ClientEvent::Error(format!("Connection closed: {}", reason))
            }
        }
        None => ClientEvent::Error("Connection closed without a status code".to_string()),
    }
}

fn dispatch_frame(text: &str, report: &impl Fn(ClientEvent)) {
    match InboundMessage::parse(text) {
        Ok(msg) => {
            debug!("Inbound {:?} (end_of_turn: {})", short_kind(&msg), msg.end_of_turn);
            report(ClientEvent::Message(msg));
        }
        Err(e) => {
            warn!("Dropping unparseable frame ({}): {}", e, preview(text, 80));
        }
    }
}

fn short_kind(msg: &InboundMessage) -> &'static str {
    use crate::protocol::InboundKind;
    match msg.kind {
        InboundKind::SetupComplete => "setup_complete",
        InboundKind::Text(_) => "text",
        InboundKind::Audio(_) => "audio",
        InboundKind::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InboundKind;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Scripted peer standing in for the proxy.
    enum Peer {
        /// Record `n` frames, then send `replies`, then close with `close`
        Script {
            n: usize,
            replies: Vec<String>,
            close: Option<(CloseCode, &'static str)>,
        },
        /// Record `n` frames then drop the TCP connection without a close frame
        Vanish { n: usize },
    }

    async fn spawn_peer(peer: Peer) -> (String, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let n = match &peer {
                Peer::Script { n, .. } | Peer::Vanish { n } => *n,
            };
            for _ in 0..n {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = frames_tx.send(serde_json::from_str(text.as_str()).unwrap());
                    }
                    other => panic!("peer expected a text frame, got {:?}", other),
                }
            }

            match peer {
                Peer::Script { replies, close, .. } => {
                    for reply in replies {
                        ws.send(Message::text(reply)).await.unwrap();
                    }
                    if let Some((code, reason)) = close {
                        let _ = ws
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                    }
                    // keep the socket open until the client goes away
                    while let Some(Ok(_)) = ws.next().await {}
                }
                Peer::Vanish { .. } => drop(ws),
            }
        });

        (url, frames_rx)
    }

    fn config(endpoint: String) -> ClientConfig {
        ClientConfig {
            endpoint,
            service_url: "wss://example.test/ws/svc".to_string(),
            model_uri: "projects/p/locations/us-central1/publishers/google/models/m".to_string(),
            response_modalities: vec![ResponseModality::Audio],
            system_instructions: "Be concise".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    async fn next_stamped(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ClientEvent {
        next_stamped(rx).await.event
    }

    #[tokio::test]
    async fn handshake_frames_come_first_and_in_order() {
        let (url, mut frames) = spawn_peer(Peer::Script {
            n: 3,
            replies: vec![],
            close: None,
        })
        .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(url), tx);

        client.connect("tok").await.unwrap();
        assert!(client.is_connected());
        client.send_text("hello").await.unwrap();

        assert_eq!(
            frames.recv().await.unwrap(),
            json!({"bearer_token": "tok", "service_url": "wss://example.test/ws/svc"})
        );
        assert_eq!(
            frames.recv().await.unwrap(),
            json!({"setup": {
                "model": "projects/p/locations/us-central1/publishers/google/models/m",
                "generation_config": {"response_modalities": ["AUDIO"]},
                "system_instruction": {"parts": [{"text": "Be concise"}]}
            }})
        );
        let third = frames.recv().await.unwrap();
        assert_eq!(third["client_content"]["turns"][0]["parts"][0]["text"], "hello");
        assert_eq!(third["client_content"]["turn_complete"], true);

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn inbound_frames_are_classified_in_order() {
        let (url, _frames) = spawn_peer(Peer::Script {
            n: 2,
            replies: vec![
                json!({"setupComplete": {}}).to_string(),
                json!({"serverContent": {"modelTurn": {"parts": [{"text": "hi"}]}}, "turnComplete": true})
                    .to_string(),
                json!({"serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "AAA="}}]}}})
                    .to_string(),
                "garbage".to_string(),
                json!({"usageMetadata": {}}).to_string(),
            ],
            close: None,
        })
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(url), tx);
        client.connect("tok").await.unwrap();

        let expected = [
            (InboundKind::SetupComplete, false),
            (InboundKind::Text("hi".to_string()), true),
            (InboundKind::Audio("AAA=".to_string()), false),
            (InboundKind::Unknown, false),
        ];
        for (kind, end_of_turn) in expected {
            assert_eq!(
                next_event(&mut rx).await,
                ClientEvent::Message(InboundMessage { kind, end_of_turn })
            );
        }
        client.disconnect().await;
    }

    #[tokio::test]
    async fn abnormal_close_code_is_reported_with_reason() {
        let (url, _frames) = spawn_peer(Peer::Script {
            n: 2,
            replies: vec![],
            close: Some((CloseCode::Error, "upstream failed")),
        })
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(url), tx);
        client.connect("tok").await.unwrap();

        match next_event(&mut rx).await {
            ClientEvent::Error(reason) => assert_eq!(reason, "Connection closed: upstream failed"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_text("late").await,
            Err(LiveError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn dropped_connection_is_reported_as_error() {
        let (url, _frames) = spawn_peer(Peer::Vanish { n: 2 }).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(url), tx);
        client.connect("tok").await.unwrap();

        match next_event(&mut rx).await {
            ClientEvent::Error(reason) => assert!(!reason.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn normal_close_is_not_an_error() {
        let (url, _frames) = spawn_peer(Peer::Script {
            n: 2,
            replies: vec![],
            close: Some((CloseCode::Normal, "")),
        })
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(url), tx);
        client.connect("tok").await.unwrap();

        assert_eq!(next_event(&mut rx).await, ClientEvent::Closed);
    }

    #[tokio::test]
    async fn send_is_rejected_before_connect() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config("ws://127.0.0.1:9".to_string()), tx);

        assert!(matches!(client.send_text("hi").await, Err(LiveError::NotConnected)));
        assert!(matches!(
            client.send(&OutboundMessage::service_setup("tok", "wss://x")).await,
            Err(LiveError::SetupOutOfOrder)
        ));
        // disconnect without a socket is harmless
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(format!("ws://{}", addr)), tx);

        assert!(client.connect("tok").await.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn events_carry_the_id_of_their_socket() {
        let (first_url, _first) = spawn_peer(Peer::Script {
            n: 2,
            replies: vec![],
            close: Some((CloseCode::Error, "boom")),
        })
        .await;
        let (second_url, _second) = spawn_peer(Peer::Script {
            n: 2,
            replies: vec![json!({"setupComplete": {}}).to_string()],
            close: None,
        })
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config(first_url.clone()), tx);

        client.connect("tok").await.unwrap();
        let first_id = client.connection();
        let stale = next_stamped(&mut rx).await;
        assert_eq!(stale.connection, first_id);
        assert!(matches!(stale.event, ClientEvent::Error(_)));

        client.disconnect().await;
        assert_ne!(client.connection(), first_id);

        client.set_config(config(second_url));
        client.connect("tok").await.unwrap();
        let fresh = next_stamped(&mut rx).await;
        assert_ne!(fresh.connection, first_id);
        assert_eq!(fresh.connection, client.connection());
        assert_eq!(
            fresh.event,
            ClientEvent::Message(InboundMessage {
                kind: InboundKind::SetupComplete,
                end_of_turn: false
            })
        );
        client.disconnect().await;
    }
}
