//! Live sessions and their authoritative documents.
//!
//! Each session holds one [`SharedDocument`] behind a mutex that is never
//! held across an `.await`, and a broadcast channel fanning frames out to
//! every connected socket.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tutorboard_core::patch::{self, ObjectQuery, Patch, PatchResult};
use tutorboard_core::sync::ServerMessage;
use tutorboard_core::{
    ContentValidator, EphemeralReaper, Origin, Provenance, SharedDocument, SnapshotStorage,
    StorageError, StoreError,
    WhiteboardObject,
};

/// Sender id for frames the server originates itself.
pub const SERVER_PEER: &str = "server";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Not in a session")]
    NoSession,
    #[error("Session state poisoned")]
    Poisoned,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A frame addressed to every socket of a session except `from`.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub from: String,
    pub message: ServerMessage,
}

struct SessionState {
    doc: SharedDocument,
    reaper: EphemeralReaper,
    peers: HashSet<String>,
    persist: bool,
}

pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    tx: broadcast::Sender<Broadcast>,
    /// Serializes snapshot writes so a newer one is never overwritten by an older one.
    save_lock: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(id: String, doc: SharedDocument, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            id,
            state: Mutex::new(SessionState {
                doc,
                reaper: EphemeralReaper::new(0),
                peers: HashSet::new(),
                persist: false,
            }),
            tx,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, ServerError> {
        self.state.lock().map_err(|_| ServerError::Poisoned)
    }

    fn broadcast(&self, from: &str, message: ServerMessage) {
        // No receivers just means nobody is listening right now
        let _ = self.tx.send(Broadcast {
            from: from.to_string(),
            message,
        });
    }

    /// Ship whatever the server itself committed to everyone.
    fn flush_server_deltas(&self, state: &mut SessionState) {
        for delta in state.doc.take_local_deltas() {
            self.broadcast(SERVER_PEER, ServerMessage::sync(SERVER_PEER, &delta.bytes));
        }
    }

    pub fn peer_count(&self) -> usize {
        self.lock().map(|s| s.peers.len()).unwrap_or(0)
    }

    pub fn version(&self) -> Result<u64, ServerError> {
        Ok(self.lock()?.doc.version())
    }

    /// Answer a `hello`: the server's state vector and what the client misses.
    pub fn welcome(&self, client_vector: &[u8]) -> Result<ServerMessage, ServerError> {
        let state = self.lock()?;
        let update = state.doc.export_since(client_vector)?;
        Ok(ServerMessage::Welcome {
            session: self.id.clone(),
            peer_count: state.peers.len(),
            state_vector: tutorboard_core::sync::encode_bytes(&state.doc.state_vector()),
            update: Some(tutorboard_core::sync::encode_bytes(&update)),
        })
    }

    /// Merge a delta from a client, repair it and fan it out.
    ///
    /// The broadcast carries everything the import and its repairs added. If
    /// a repair was needed it goes to the sender too.
    pub fn apply_client_delta(
        &self,
        peer_id: &str,
        bytes: &[u8],
        validator: &ContentValidator,
    ) -> Result<(), ServerError> {
        let mut state = self.lock()?;
        let before = state.doc.state_vector();
        let changes = state.doc.apply_remote_delta(bytes, Origin::Remote)?;
        let fixes = validator.repair_import(&mut state.doc, &changes)?;
        // Repairs are part of the combined delta below
        state.doc.take_local_deltas();

        if state.doc.state_vector() == before {
            debug!("Delta from {} was already known", peer_id);
            return Ok(());
        }
        let combined = state.doc.export_since(&before)?;
        let from = if fixes.is_empty() { peer_id } else { SERVER_PEER };
        if !fixes.is_empty() {
            warn!("Repaired {} objects from {} in session {}", fixes.len(), peer_id, self.id);
        }
        self.broadcast(from, ServerMessage::sync(from, &combined));
        Ok(())
    }

    pub fn apply_patch(
        &self,
        patch: &Patch,
        last_known_version: u64,
        validator: &ContentValidator,
    ) -> Result<PatchResult, ServerError> {
        let mut state = self.lock()?;
        let result = patch::apply_patch(
            &mut state.doc,
            patch,
            last_known_version,
            validator,
            Provenance::TrustedAgent,
            Origin::Agent,
        )?;
        self.flush_server_deltas(&mut state);
        Ok(result)
    }

    pub fn summary(&self) -> Result<String, ServerError> {
        Ok(patch::summarize(&self.lock()?.doc))
    }

    pub fn find(&self, query: &ObjectQuery) -> Result<Vec<WhiteboardObject>, ServerError> {
        Ok(patch::find_objects(&self.lock()?.doc, query))
    }

    pub fn request_persist(&self) -> Result<(), ServerError> {
        self.lock()?.persist = true;
        info!("Session {} will be persisted", self.id);
        Ok(())
    }

    /// Write a snapshot if persistence was requested. Returns whether one was written.
    async fn save_to(&self, storage: &dyn SnapshotStorage) -> Result<bool, ServerError> {
        let _saving = self.save_lock.lock().await;
        let snapshot = {
            let state = self.lock()?;
            if !state.persist {
                return Ok(false);
            }
            state.doc.export_snapshot()?
        };
        storage.save(&self.id, &snapshot).await?;
        info!("Session {} persisted ({} bytes)", self.id, snapshot.len());
        Ok(true)
    }

    /// Reap expired ephemerals. Returns how many were removed.
    pub fn sweep(&self, now: u64) -> Result<usize, ServerError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let changes = state.reaper.sweep(&mut state.doc, now)?;
        self.flush_server_deltas(state);
        Ok(changes.len())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }
}

/// All live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    storage: Arc<dyn SnapshotStorage>,
    validator: ContentValidator,
    channel_capacity: usize,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn SnapshotStorage>, channel_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            storage,
            validator: ContentValidator::default(),
            channel_capacity,
        }
    }

    pub fn validator(&self) -> &ContentValidator {
        &self.validator
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, ServerError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ServerError::NotFound(session_id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Restore a persisted snapshot, or start empty.
    async fn load_document(&self, session_id: &str) -> SharedDocument {
        match self.storage.load(session_id).await {
            Ok(bytes) => match SharedDocument::from_snapshot(&bytes) {
                Ok(doc) => {
                    info!("Restored session {} from snapshot", session_id);
                    doc
                }
                Err(e) => {
                    warn!("Snapshot for {} is unreadable, starting empty: {}", session_id, e);
                    SharedDocument::new()
                }
            },
            Err(StorageError::NotFound(_)) => SharedDocument::new(),
            Err(e) => {
                warn!("Failed to load snapshot for {}: {}", session_id, e);
                SharedDocument::new()
            }
        }
    }

    /// Add a peer while the caller holds the session's map entry, so a
    /// concurrent last leave cannot drop the session underneath it.
    fn register(
        session: &Arc<Session>,
        peer_id: &str,
    ) -> Result<(Arc<Session>, usize), ServerError> {
        let mut state = session.lock()?;
        state.peers.insert(peer_id.to_string());
        Ok((Arc::clone(session), state.peers.len()))
    }

    /// Add `peer_id` to a session, creating it on first connection.
    pub async fn join(
        &self,
        session_id: &str,
        peer_id: &str,
    ) -> Result<(Arc<Session>, broadcast::Receiver<Broadcast>), ServerError> {
        let live = match self.sessions.get(session_id) {
            Some(entry) => Some(Self::register(entry.value(), peer_id)?),
            None => None,
        };
        let (session, peer_count) = match live {
            Some(joined) => joined,
            None => {
                let doc = self.load_document(session_id).await;
                let fresh =
                    Arc::new(Session::new(session_id.to_string(), doc, self.channel_capacity));
                // Another socket may have created it while we were loading
                let entry = self.sessions.entry(session_id.to_string()).or_insert(fresh);
                Self::register(entry.value(), peer_id)?
            }
        };
        session.broadcast(peer_id, ServerMessage::PeerJoined { peer_id: peer_id.to_string() });
        // Subscribe before the caller exports the welcome so no delta falls in between
        let rx = session.subscribe();
        info!("Peer {} joined session {} ({} peers)", peer_id, session_id, peer_count);
        Ok((session, rx))
    }

    /// Remove `peer_id`. The last one out drops the session, persisting it first if asked.
    ///
    /// The snapshot is written while the session is still registered, so a
    /// peer joining meanwhile attaches to the live document instead of
    /// loading a snapshot that is not yet on disk.
    pub async fn leave(&self, session: &Arc<Session>, peer_id: &str) -> Result<(), ServerError> {
        let remaining = {
            let mut state = session.lock()?;
            if !state.peers.remove(peer_id) {
                return Ok(());
            }
            state.peers.len()
        };
        session.broadcast(peer_id, ServerMessage::PeerLeft { peer_id: peer_id.to_string() });
        info!("Peer {} left session {}", peer_id, session.id());
        if remaining > 0 {
            return Ok(());
        }

        let saved = session.save_to(self.storage.as_ref()).await;
        let removed = self
            .sessions
            .remove_if(session.id(), |_, live| {
                Arc::ptr_eq(live, session) && live.peer_count() == 0
            });
        match removed {
            Some(_) => info!("Session {} closed", session.id()),
            None => debug!("Session {} was rejoined before closing", session.id()),
        }
        saved.map(|_| ())
    }

    /// Sweep every session once.
    pub fn sweep_all(&self, now: u64) {
        if self.is_empty() {
            return;
        }
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in sessions {
            match session.sweep(now) {
                Ok(0) => {}
                Ok(n) => debug!("Reaped {} ephemeral objects in {}", n, session.id()),
                Err(e) => warn!("Sweep failed for {}: {}", session.id(), e),
            }
        }
    }
}
