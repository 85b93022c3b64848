//! WebSocket client for collaboration.
//!
//! Defines the wire protocol shared with the relay server and a native
//! WebSocket client that runs on a background thread and is polled.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a session, announcing what this replica already has
    Hello {
        session: String,
        /// Base64 encoded Loro version vector
        state_vector: String,
    },
    /// Leave the current session
    Leave,
    /// Sync CRDT data (base64 encoded Loro bytes)
    Sync { data: String },
    /// Keep a durable snapshot of the session after the last peer leaves
    Persist,
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake reply with the server's state and the client's catch-up delta
    Welcome {
        session: String,
        peer_count: usize,
        state_vector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update: Option<String>,
    },
    /// Peer joined the session
    PeerJoined { peer_id: String },
    /// Peer left the session
    PeerLeft { peer_id: String },
    /// Sync data from another peer (or from the server itself)
    Sync { from: String, data: String },
    /// Error message
    Error { message: String },
}

/// Why a channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The user ended the session. No reconnect.
    EndedByUser,
    /// Something failed. The client reconnects.
    Error,
}

impl CloseReason {
    /// WebSocket close code.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::EndedByUser => 1000,
            CloseReason::Error => 1011,
        }
    }

    pub fn from_code(code: u16) -> Self {
        if code == 1000 { CloseReason::EndedByUser } else { CloseReason::Error }
    }

    pub fn message(self) -> &'static str {
        match self {
            CloseReason::EndedByUser => "ended by user",
            CloseReason::Error => "error",
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from the WebSocket client
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Channel open
    Connected,
    /// Channel closed
    Disconnected { reason: CloseReason },
    /// Handshake completed
    Welcome {
        session: String,
        peer_count: usize,
        state_vector: Option<Vec<u8>>,
        update: Option<Vec<u8>>,
    },
    /// A peer joined the session
    PeerJoined { peer_id: String },
    /// A peer left the session
    PeerLeft { peer_id: String },
    /// Received sync data
    SyncReceived { from: String, data: Vec<u8> },
    /// Error occurred
    Error { message: String },
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Base64 encoding for binary payloads in JSON frames
pub fn encode_bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Base64 decoding for binary payloads in JSON frames
pub fn decode_bytes(input: &str) -> Result<Vec<u8>, TransportError> {
    STANDARD.decode(input).map_err(|e| TransportError::Decode(e.to_string()))
}

impl ClientMessage {
    pub fn hello(session: impl Into<String>, state_vector: &[u8]) -> Self {
        ClientMessage::Hello {
            session: session.into(),
            state_vector: encode_bytes(state_vector),
        }
    }

    pub fn sync(bytes: &[u8]) -> Self {
        ClientMessage::Sync { data: encode_bytes(bytes) }
    }
}

impl ServerMessage {
    pub fn sync(from: impl Into<String>, bytes: &[u8]) -> Self {
        ServerMessage::Sync {
            from: from.into(),
            data: encode_bytes(bytes),
        }
    }

    /// Convert into a client-side event. Frames with undecodable payloads
    /// are dropped with a warning.
    pub fn into_event(self) -> Option<SyncEvent> {
        Some(match self {
            ServerMessage::Welcome { session, peer_count, state_vector, update } => {
                let state_vector = decode_bytes(&state_vector).ok();
                let update = match update {
                    Some(data) => Some(decode_bytes(&data).ok()?),
                    None => None,
                };
                SyncEvent::Welcome { session, peer_count, state_vector, update }
            }
            ServerMessage::PeerJoined { peer_id } => SyncEvent::PeerJoined { peer_id },
            ServerMessage::PeerLeft { peer_id } => SyncEvent::PeerLeft { peer_id },
            ServerMessage::Sync { from, data } => match decode_bytes(&data) {
                Ok(data) => SyncEvent::SyncReceived { from, data },
                Err(e) => {
                    log::warn!("Dropping sync frame from {}: {}", from, e);
                    return None;
                }
            },
            ServerMessage::Error { message } => SyncEvent::Error { message },
        })
    }
}

/// A message channel to the relay.
///
/// Implementations are polled; they never call back into the caller.
pub trait Connection {
    /// Open a channel to `url`.
    fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    /// Close the channel.
    fn disconnect(&mut self, reason: CloseReason);

    /// Queue a message for sending.
    fn send(&self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Drain pending events (non-blocking).
    fn poll_events(&mut self) -> Vec<SyncEvent>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Check if connected.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

// ============================================================================
// In-memory connection
// ============================================================================

/// A connection that records what is sent and replays injected events.
///
/// Useful for embedding the engine without a socket and for tests.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    state: Option<ConnectionState>,
    sent: std::sync::Mutex<Vec<ClientMessage>>,
    inbox: Vec<SyncEvent>,
    connects: usize,
    /// When set, `connect` fails with this message.
    pub refuse: Option<String>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for the next `poll_events`.
    pub fn push_event(&mut self, event: SyncEvent) {
        self.inbox.push(event);
    }

    /// Queue a server frame for the next `poll_events`.
    pub fn push_message(&mut self, message: ServerMessage) {
        if let Some(event) = message.into_event() {
            self.inbox.push(event);
        }
    }

    /// Drain the messages sent so far.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => Vec::new(),
        }
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.connects
    }

    /// Simulate the channel dropping.
    pub fn drop_channel(&mut self) {
        self.state = Some(ConnectionState::Disconnected);
        self.inbox.push(SyncEvent::Disconnected { reason: CloseReason::Error });
    }
}

impl Connection for MemoryConnection {
    fn connect(&mut self, _url: &str) -> Result<(), TransportError> {
        if self.state == Some(ConnectionState::Connected) {
            return Err(TransportError::AlreadyConnected);
        }
        if let Some(message) = &self.refuse {
            self.inbox.push(SyncEvent::Error { message: message.clone() });
            self.state = Some(ConnectionState::Error);
            return Ok(());
        }
        self.connects += 1;
        self.state = Some(ConnectionState::Connected);
        self.inbox.push(SyncEvent::Connected);
        Ok(())
    }

    fn disconnect(&mut self, _reason: CloseReason) {
        self.state = Some(ConnectionState::Disconnected);
    }

    fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        if self.state != Some(ConnectionState::Connected) {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .map_err(|e| TransportError::Send(e.to_string()))?
            .push(message.clone());
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.inbox)
    }

    fn state(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Disconnected)
    }
}

// ============================================================================
// Native WebSocket Client
// ============================================================================

mod native_client {
    use super::*;
    use std::borrow::Cow;
    use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::protocol::CloseFrame;
    use tungstenite::protocol::frame::coding::CloseCode;
    use tungstenite::{connect, Message};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close(CloseReason),
    }

    /// WebSocket client for native platforms.
    ///
    /// Uses a background thread for non-blocking operation.
    pub struct NativeWebSocket {
        state: ConnectionState,
        events: Vec<SyncEvent>,
        /// Channel to send commands to the WebSocket thread.
        cmd_tx: Option<Sender<WsCommand>>,
        /// Channel to receive events from the WebSocket thread.
        event_rx: Option<Receiver<SyncEvent>>,
        /// Handle to the WebSocket thread.
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        /// Create a new disconnected WebSocket client.
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                events: Vec::new(),
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }
    }

    fn close_frame(reason: CloseReason) -> CloseFrame<'static> {
        let code = match reason {
            CloseReason::EndedByUser => CloseCode::Normal,
            CloseReason::Error => CloseCode::Error,
        };
        CloseFrame {
            code,
            reason: Cow::Borrowed(reason.message()),
        }
    }

    /// First 100 characters of a frame, for logging.
    fn preview(text: &str) -> &str {
        match text.char_indices().nth(100) {
            Some((end, _)) => &text[..end],
            None => text,
        }
    }

    fn run(url: String, cmd_rx: Receiver<WsCommand>, event_tx: Sender<SyncEvent>) {
        log::info!("WebSocket thread: connecting to {}", url);

        let (mut socket, response) = match connect(&url) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("WebSocket connection failed: {}", e);
                let _ = event_tx.send(SyncEvent::Error {
                    message: format!("Connection failed: {}", e),
                });
                return;
            }
        };
        log::info!("WebSocket connected, status: {}", response.status());
        let _ = event_tx.send(SyncEvent::Connected);

        // Short read timeout so the loop can service outgoing commands
        match socket.get_mut() {
            tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
                let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
            }
            #[allow(unreachable_patterns)]
            _ => log::debug!("TLS or other stream - using default timeout handling"),
        }

        let mut reason = CloseReason::Error;
        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(msg)) => {
                    log::debug!("WebSocket sending: {}", preview(&msg));
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("WebSocket send error: {}", e);
                        break;
                    }
                }
                Ok(WsCommand::Close(requested)) => {
                    log::info!("WebSocket close requested ({})", requested.message());
                    let _ = socket.close(Some(close_frame(requested)));
                    reason = requested;
                    break;
                }
                Err(TryRecvError::Disconnected) => {
                    log::info!("WebSocket command channel disconnected");
                    reason = CloseReason::EndedByUser;
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            match socket.read() {
                Ok(Message::Text(txt)) => {
                    log::debug!("WebSocket received: {}", preview(&txt));
                    match serde_json::from_str::<ServerMessage>(&txt) {
                        Ok(msg) => {
                            if let Some(event) = msg.into_event() {
                                let _ = event_tx.send(event);
                            }
                        }
                        Err(e) => log::warn!("Failed to parse server message: {}", e),
                    }
                }
                Ok(Message::Binary(data)) => {
                    let _ = event_tx.send(SyncEvent::SyncReceived {
                        from: "server".to_string(),
                        data,
                    });
                }
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(frame)) => {
                    log::info!("WebSocket received close frame");
                    reason = frame
                        .map(|f| CloseReason::from_code(u16::from(f.code)))
                        .unwrap_or(CloseReason::Error);
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }

        log::info!("WebSocket thread exiting");
        let _ = event_tx.send(SyncEvent::Disconnected { reason });
    }

    impl Connection for NativeWebSocket {
        fn connect(&mut self, url: &str) -> Result<(), TransportError> {
            if self.cmd_tx.is_some() {
                return Err(TransportError::AlreadyConnected);
            }

            let parsed_url =
                Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(TransportError::InvalidUrl(format!(
                    "Invalid WebSocket URL scheme: {}",
                    parsed_url.scheme()
                )));
            }

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<SyncEvent>();
            let url = url.to_string();
            let handle = thread::spawn(move || run(url, cmd_rx, event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);
            Ok(())
        }

        fn disconnect(&mut self, reason: CloseReason) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close(reason));
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }

        fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
            let json = serde_json::to_string(message)?;
            match &self.cmd_tx {
                Some(tx) => tx
                    .send(WsCommand::Send(json))
                    .map_err(|e| TransportError::Send(e.to_string())),
                None => Err(TransportError::NotConnected),
            }
        }

        fn poll_events(&mut self) -> Vec<SyncEvent> {
            let mut closed = false;
            if let Some(rx) = &self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    match &event {
                        SyncEvent::Connected => self.state = ConnectionState::Connected,
                        SyncEvent::Disconnected { .. } => {
                            self.state = ConnectionState::Disconnected;
                            closed = true;
                        }
                        SyncEvent::Error { .. } => {
                            self.state = ConnectionState::Error;
                            closed = true;
                        }
                        _ => {}
                    }
                    self.events.push(event);
                }
            }
            if closed {
                // The thread is gone; allow a fresh connect
                self.cmd_tx = None;
                self.event_rx = None;
                self._thread = None;
            }
            std::mem::take(&mut self.events)
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    impl Default for NativeWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.disconnect(CloseReason::EndedByUser);
        }
    }
}

pub use native_client::NativeWebSocket;
