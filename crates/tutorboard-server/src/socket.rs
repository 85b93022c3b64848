//! WebSocket connections.
//!
//! ## Protocol
//!
//! Messages are JSON with the following format:
//! ```json
//! { "type": "hello", "session": "lesson-1", "state_vector": "<base64>" }
//! { "type": "sync", "data": "<base64-encoded-loro-bytes>" }
//! { "type": "persist" }
//! { "type": "leave" }
//! ```
//! Binary frames are treated as raw sync data.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tutorboard_core::sync::{decode_bytes, ClientMessage, CloseReason, ServerMessage};
use uuid::Uuid;

use crate::registry::{Broadcast, ServerError, Session, SessionRegistry};

type Sender = SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn send_message(sender: &mut Sender, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            true
        }
    }
}

async fn send_error(sender: &mut Sender, message: impl Into<String>) -> bool {
    send_message(sender, &ServerMessage::Error { message: message.into() }).await
}

async fn close(sender: &mut Sender, reason: CloseReason, detail: &str) {
    let frame = CloseFrame {
        code: reason.code(),
        reason: detail.to_string().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

struct Membership {
    session: Arc<Session>,
    rx: broadcast::Receiver<Broadcast>,
}

/// Per-connection state.
struct PeerConnection {
    peer_id: String,
    registry: Arc<SessionRegistry>,
    membership: Option<Membership>,
}

impl PeerConnection {
    async fn leave(&mut self) {
        if let Some(membership) = self.membership.take() {
            if let Err(e) = self.registry.leave(&membership.session, &self.peer_id).await {
                warn!("Leave failed for {}: {}", self.peer_id, e);
            }
        }
    }

    async fn hello(
        &mut self,
        sender: &mut Sender,
        session_id: &str,
        state_vector: &str,
    ) -> Result<bool, ServerError> {
        let client_vector = match decode_bytes(state_vector) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(send_error(sender, format!("Invalid state vector: {}", e)).await),
        };
        self.leave().await;

        let (session, rx) = self.registry.join(session_id, &self.peer_id).await?;
        let welcome = match session.welcome(&client_vector) {
            Ok(welcome) => welcome,
            Err(e) => {
                self.membership = Some(Membership { session, rx });
                return Err(e);
            }
        };
        self.membership = Some(Membership { session, rx });
        Ok(send_message(sender, &welcome).await)
    }

    fn sync(&self, bytes: &[u8]) -> Result<(), ServerError> {
        let membership = self.membership.as_ref().ok_or(ServerError::NoSession)?;
        membership
            .session
            .apply_client_delta(&self.peer_id, bytes, self.registry.validator())
    }

    /// Report a failed frame. Returns false once the socket should close.
    async fn respond(&self, sender: &mut Sender, result: Result<bool, ServerError>) -> bool {
        match result {
            Ok(open) => open,
            Err(ServerError::NoSession) => send_error(sender, "Send hello first").await,
            Err(e) => {
                warn!("Closing {} after error: {}", self.peer_id, e);
                let _ = send_error(sender, e.to_string()).await;
                close(sender, CloseReason::Error, "server error").await;
                false
            }
        }
    }

    /// Handle one client frame. Returns false once the socket should close.
    async fn on_message(&mut self, sender: &mut Sender, message: ClientMessage) -> bool {
        let result = match message {
            ClientMessage::Hello { session, state_vector } => {
                self.hello(sender, &session, &state_vector).await
            }
            ClientMessage::Leave => {
                self.leave().await;
                Ok(true)
            }
            ClientMessage::Sync { data } => match decode_bytes(&data) {
                Ok(bytes) => self.sync(&bytes).map(|_| true),
                Err(e) => Ok(send_error(sender, format!("Invalid sync payload: {}", e)).await),
            },
            ClientMessage::Persist => match &self.membership {
                Some(membership) => membership.session.request_persist().map(|_| true),
                None => Err(ServerError::NoSession),
            },
        };
        self.respond(sender, result).await
    }

    async fn on_binary(&mut self, sender: &mut Sender, bytes: &[u8]) -> bool {
        let result = self.sync(bytes).map(|_| true);
        self.respond(sender, result).await
    }
}

async fn next_broadcast(
    membership: &mut Option<Membership>,
) -> Result<Broadcast, broadcast::error::RecvError> {
    match membership {
        Some(membership) => membership.rx.recv().await,
        // No session joined, just wait forever
        None => std::future::pending().await,
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut conn = PeerConnection {
        peer_id: peer_id.clone(),
        registry,
        membership: None,
    };

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let open = match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => conn.on_message(&mut sender, message).await,
                            Err(e) => {
                                warn!("Invalid message from {}: {}", peer_id, e);
                                send_error(&mut sender, format!("Invalid message: {}", e)).await
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // Binary messages are treated as raw sync data
                        conn.on_binary(&mut sender, &data).await
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Close from {}: {:?}", peer_id, frame.map(|f| f.code));
                        false
                    }
                    None => false,
                    Some(Ok(_)) => true, // Ignore ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer_id, e);
                        false
                    }
                };
                if !open {
                    break;
                }
            }

            msg = next_broadcast(&mut conn.membership) => {
                match msg {
                    Ok(Broadcast { from, message }) => {
                        // Don't echo back to sender
                        if from != peer_id && !send_message(&mut sender, &message).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The client reconnects and catches up through the handshake
                        warn!("{} lagged by {} frames, closing", peer_id, skipped);
                        close(&mut sender, CloseReason::Error, "lagged").await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    conn.leave().await;
    info!("Connection closed: {}", peer_id);
}
