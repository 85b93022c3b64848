//! Collaboration management for real-time multi-user editing.
//!
//! This module drives a [`Connection`] for one session: it runs the
//! state-vector handshake, ships local deltas, imports remote ones, buffers
//! while offline and reconnects with exponential backoff.

use crate::crdt::{DocChange, LocalDelta, Origin, SharedDocument, StoreResult};
use crate::sync::{ClientMessage, CloseReason, Connection, SyncEvent, TransportError};

/// First reconnect delay.
pub const INITIAL_BACKOFF_MS: u64 = 500;
/// Reconnect delay cap.
pub const MAX_BACKOFF_MS: u64 = 10_000;

/// Exponential backoff for reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            current_ms: initial_ms,
        }
    }

    /// Delay before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> u64 {
        let delay = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF_MS, MAX_BACKOFF_MS)
    }
}

/// Where the channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Disconnected,
    Connecting,
    /// Channel open, `hello` sent, waiting for `welcome`.
    Handshaking,
    Live,
}

/// Keeps one [`SharedDocument`] in sync with the relay.
pub struct CollaborationManager<C: Connection> {
    connection: C,
    url: String,
    session: Option<String>,
    phase: SyncPhase,
    /// Local deltas produced while not live.
    pending: Vec<Vec<u8>>,
    backoff: Backoff,
    reconnect_at: Option<u64>,
    closed_by_user: bool,
    peer_count: usize,
}

impl<C: Connection> CollaborationManager<C> {
    /// Create a new collaboration manager.
    pub fn new(connection: C, url: impl Into<String>) -> Self {
        Self {
            connection,
            url: url.into(),
            session: None,
            phase: SyncPhase::Disconnected,
            pending: Vec::new(),
            backoff: Backoff::default(),
            reconnect_at: None,
            closed_by_user: false,
            peer_count: 0,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_live(&self) -> bool {
        self.phase == SyncPhase::Live
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    /// Number of local deltas waiting for a live channel.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn reconnect_at(&self) -> Option<u64> {
        self.reconnect_at
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    // --- Session lifecycle ---

    /// Join `session`. The handshake runs from [`Self::poll`].
    pub fn open(&mut self, session: impl Into<String>) -> Result<(), TransportError> {
        self.session = Some(session.into());
        self.closed_by_user = false;
        self.backoff.reset();
        self.connect()
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        self.reconnect_at = None;
        self.phase = SyncPhase::Connecting;
        if let Err(e) = self.connection.connect(&self.url) {
            self.phase = SyncPhase::Disconnected;
            return Err(e);
        }
        Ok(())
    }

    /// End the session. No reconnect follows.
    pub fn close(&mut self) {
        if self.is_live() {
            if let Err(e) = self.connection.send(&ClientMessage::Leave) {
                log::debug!("Leave not sent: {}", e);
            }
        }
        self.connection.disconnect(CloseReason::EndedByUser);
        self.closed_by_user = true;
        self.reconnect_at = None;
        self.phase = SyncPhase::Disconnected;
        log::info!("Collaboration session closed by user");
    }

    /// Ask the server to keep a durable snapshot of this session.
    pub fn request_persist(&mut self) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::NotConnected);
        }
        self.connection.send(&ClientMessage::Persist)
    }

    // --- Outbound ---

    /// Push a local delta to peers, or buffer it until the channel is live.
    ///
    /// Deltas that originated remotely are never re-broadcast.
    pub fn send(&mut self, delta: &LocalDelta) {
        if delta.origin.is_remote() {
            log::debug!("Not echoing remote delta ({} bytes)", delta.bytes.len());
            return;
        }
        if !self.is_live() {
            self.pending.push(delta.bytes.clone());
            return;
        }
        if let Err(e) = self.connection.send(&ClientMessage::sync(&delta.bytes)) {
            log::warn!("Send failed, buffering delta: {}", e);
            self.pending.push(delta.bytes.clone());
        }
    }

    /// Send every delta the store has queued since the last call.
    pub fn flush_local(&mut self, store: &mut SharedDocument) {
        for delta in store.take_local_deltas() {
            self.send(&delta);
        }
    }

    // --- Inbound ---

    /// Feed bytes from a peer into the store.
    pub fn on_message(
        &mut self,
        store: &mut SharedDocument,
        bytes: &[u8],
    ) -> StoreResult<Vec<DocChange>> {
        store.apply_remote_delta(bytes, Origin::Remote)
    }

    /// Drive the connection: ship local deltas, handle events, reconnect.
    ///
    /// Returns the remote changes applied to `store` during this call.
    pub fn poll(&mut self, store: &mut SharedDocument, now: u64) -> Vec<DocChange> {
        self.flush_local(store);

        if self.phase == SyncPhase::Disconnected && !self.closed_by_user && self.session.is_some() {
            if let Some(at) = self.reconnect_at {
                if now >= at {
                    log::info!("Reconnecting to {}", self.url);
                    if let Err(e) = self.connect() {
                        log::warn!("Reconnect failed: {}", e);
                        self.schedule_reconnect(now);
                    }
                }
            }
        }

        let mut changes = Vec::new();
        for event in self.connection.poll_events() {
            self.handle_event(store, event, now, &mut changes);
        }
        changes
    }

    fn handle_event(
        &mut self,
        store: &mut SharedDocument,
        event: SyncEvent,
        now: u64,
        changes: &mut Vec<DocChange>,
    ) {
        match event {
            SyncEvent::Connected => {
                let Some(session) = self.session.clone() else {
                    return;
                };
                self.phase = SyncPhase::Handshaking;
                let hello = ClientMessage::hello(session, &store.state_vector());
                if let Err(e) = self.connection.send(&hello) {
                    log::warn!("Failed to send hello: {}", e);
                }
            }
            SyncEvent::Welcome { session, peer_count, state_vector, update } => {
                log::info!("Joined session {} with {} peers", session, peer_count);
                self.peer_count = peer_count;
                if let Some(update) = update {
                    match store.apply_remote_delta(&update, Origin::Remote) {
                        Ok(applied) => changes.extend(applied),
                        Err(e) => log::error!("Failed to import catch-up: {}", e),
                    }
                }
                self.phase = SyncPhase::Live;
                self.backoff.reset();
                self.send_catch_up(store, state_vector.as_deref());
            }
            SyncEvent::SyncReceived { from, data } => match self.on_message(store, &data) {
                Ok(applied) => changes.extend(applied),
                Err(e) => log::error!("Failed to import delta from {}: {}", from, e),
            },
            SyncEvent::PeerJoined { peer_id } => {
                self.peer_count += 1;
                log::info!("Peer joined: {}", peer_id);
            }
            SyncEvent::PeerLeft { peer_id } => {
                self.peer_count = self.peer_count.saturating_sub(1);
                log::info!("Peer left: {}", peer_id);
            }
            SyncEvent::Disconnected { reason } => {
                let was = self.phase;
                self.phase = SyncPhase::Disconnected;
                if self.closed_by_user || reason == CloseReason::EndedByUser {
                    log::info!("Channel closed ({})", reason.message());
                    self.closed_by_user = true;
                } else {
                    log::warn!("Channel lost while {:?}", was);
                    self.schedule_reconnect(now);
                }
            }
            SyncEvent::Error { message } => {
                log::warn!("Sync error: {}", message);
                if self.phase == SyncPhase::Connecting {
                    self.phase = SyncPhase::Disconnected;
                    self.schedule_reconnect(now);
                }
            }
        }
    }

    /// Send what the server is missing, then drop the offline buffer.
    fn send_catch_up(&mut self, store: &SharedDocument, server_vector: Option<&[u8]>) {
        let catch_up = server_vector.map(|sv| store.export_since(sv));
        match catch_up {
            Some(Ok(bytes)) => {
                if let Err(e) = self.connection.send(&ClientMessage::sync(&bytes)) {
                    log::warn!("Failed to send catch-up: {}", e);
                    return;
                }
                // The catch-up covers every buffered delta
                self.pending.clear();
            }
            other => {
                if let Some(Err(e)) = other {
                    log::warn!("Server state vector unusable ({}), flushing buffer", e);
                }
                let pending = std::mem::take(&mut self.pending);
                for (i, bytes) in pending.iter().enumerate() {
                    if let Err(e) = self.connection.send(&ClientMessage::sync(bytes)) {
                        log::warn!("Flush interrupted: {}", e);
                        self.pending.extend_from_slice(&pending[i..]);
                        return;
                    }
                }
            }
        }
    }

    fn schedule_reconnect(&mut self, now: u64) {
        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(now + delay);
        log::info!("Reconnecting in {} ms", delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Collection;
    use crate::object::WhiteboardObject;
    use crate::sync::{decode_bytes, MemoryConnection, ServerMessage};

    fn manager() -> CollaborationManager<MemoryConnection> {
        CollaborationManager::new(MemoryConnection::new(), "ws://relay/ws")
    }

    fn sync_payloads(sent: Vec<ClientMessage>) -> Vec<Vec<u8>> {
        sent.into_iter()
            .filter_map(|m| match m {
                ClientMessage::Sync { data } => decode_bytes(&data).ok(),
                _ => None,
            })
            .collect()
    }

    /// Answer the client's hello the way the relay does.
    fn welcome(client: &mut CollaborationManager<MemoryConnection>, server: &SharedDocument) {
        let sent = client.connection().take_sent();
        let client_vector = sent
            .iter()
            .find_map(|m| match m {
                ClientMessage::Hello { state_vector, .. } => decode_bytes(state_vector).ok(),
                _ => None,
            })
            .expect("hello not sent");
        let update = server.export_since(&client_vector).unwrap();
        client.connection_mut().push_message(ServerMessage::Welcome {
            session: "s".into(),
            peer_count: 1,
            state_vector: crate::sync::encode_bytes(&server.state_vector()),
            update: Some(crate::sync::encode_bytes(&update)),
        });
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(500, 3_000);
        assert_eq!(b.next_delay(), 500);
        assert_eq!(b.next_delay(), 1_000);
        assert_eq!(b.next_delay(), 2_000);
        assert_eq!(b.next_delay(), 3_000);
        assert_eq!(b.next_delay(), 3_000);
        b.reset();
        assert_eq!(b.next_delay(), 500);
    }

    #[test]
    fn test_handshake_exchanges_missing_state() {
        let mut server = SharedDocument::with_peer_id(1).unwrap();
        server
            .set(Collection::Objects, &WhiteboardObject::text("s", "server side"), Origin::Agent)
            .unwrap();
        let mut store = SharedDocument::with_peer_id(2).unwrap();
        store
            .set(Collection::Objects, &WhiteboardObject::text("c", "offline edit"), Origin::Local)
            .unwrap();

        let mut client = manager();
        client.open("s").unwrap();
        client.poll(&mut store, 0);
        assert_eq!(client.phase(), SyncPhase::Handshaking);
        assert_eq!(client.pending_len(), 1);

        welcome(&mut client, &server);
        let changes = client.poll(&mut store, 1);
        assert_eq!(changes.len(), 1);
        assert!(client.is_live());
        assert_eq!(client.pending_len(), 0);

        for bytes in sync_payloads(client.connection().take_sent()) {
            server.apply_remote_delta(&bytes, Origin::Remote).unwrap();
        }
        assert_eq!(server.board_state(), store.board_state());
    }

    #[test]
    fn test_remote_deltas_are_not_echoed() {
        let mut peer = SharedDocument::with_peer_id(9).unwrap();
        peer.set(Collection::Objects, &WhiteboardObject::rectangle("r"), Origin::Local)
            .unwrap();
        let delta = peer.take_local_deltas().remove(0);

        let mut store = SharedDocument::with_peer_id(2).unwrap();
        let mut client = manager();
        client.open("s").unwrap();
        client.poll(&mut store, 0);
        welcome(&mut client, &SharedDocument::with_peer_id(1).unwrap());
        client.poll(&mut store, 0);
        client.connection().take_sent();

        client.connection_mut().push_message(ServerMessage::sync("peer-9", &delta.bytes));
        let changes = client.poll(&mut store, 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].origin, Origin::Remote);

        client.poll(&mut store, 2);
        assert!(client.connection().take_sent().is_empty());

        // Even an explicit send of a remote-tagged delta is suppressed
        client.send(&LocalDelta { bytes: delta.bytes, origin: Origin::Remote });
        assert!(client.connection().take_sent().is_empty());
    }

    #[test]
    fn test_edits_survive_reconnect() {
        let server = SharedDocument::with_peer_id(1).unwrap();
        let mut store = SharedDocument::with_peer_id(2).unwrap();
        let mut client = manager();
        client.open("s").unwrap();
        client.poll(&mut store, 0);
        welcome(&mut client, &server);
        client.poll(&mut store, 0);
        client.connection().take_sent();

        client.connection_mut().drop_channel();
        client.poll(&mut store, 100);
        assert_eq!(client.phase(), SyncPhase::Disconnected);
        assert_eq!(client.reconnect_at(), Some(100 + INITIAL_BACKOFF_MS));

        store
            .set(Collection::Objects, &WhiteboardObject::text("t", "while offline"), Origin::Local)
            .unwrap();
        client.poll(&mut store, 200);
        assert_eq!(client.pending_len(), 1);
        assert_eq!(client.connection().connect_count(), 1);

        client.poll(&mut store, 100 + INITIAL_BACKOFF_MS);
        assert_eq!(client.connection().connect_count(), 2);
        welcome(&mut client, &server);
        client.poll(&mut store, 700);

        let mut replica = SharedDocument::with_peer_id(1).unwrap();
        for bytes in sync_payloads(client.connection().take_sent()) {
            replica.apply_remote_delta(&bytes, Origin::Remote).unwrap();
        }
        assert!(replica.contains(Collection::Objects, "t"));
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn test_user_close_does_not_reconnect() {
        let mut store = SharedDocument::new();
        let mut client = manager();
        client.open("s").unwrap();
        client.poll(&mut store, 0);
        client.close();
        client.poll(&mut store, 60_000);
        assert_eq!(client.connection().connect_count(), 1);
        assert_eq!(client.reconnect_at(), None);
    }

    #[test]
    fn test_failed_connect_backs_off() {
        let mut store = SharedDocument::new();
        let mut conn = MemoryConnection::new();
        conn.refuse = Some("refused".into());
        let mut client = CollaborationManager::new(conn, "ws://relay/ws");
        client.open("s").unwrap();
        client.poll(&mut store, 0);
        assert_eq!(client.reconnect_at(), Some(INITIAL_BACKOFF_MS));
        client.poll(&mut store, INITIAL_BACKOFF_MS);
        assert_eq!(client.reconnect_at(), Some(INITIAL_BACKOFF_MS + 2 * INITIAL_BACKOFF_MS));
    }
}
