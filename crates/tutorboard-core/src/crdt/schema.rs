//! Loro document schema and operations.

use std::collections::BTreeMap;

use loro::{
    Container, ExportMode, LoroDoc, LoroError, LoroMap, LoroValue, ValueOrContainer, VersionVector,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::convert::{object_fields, object_from_loro};
use crate::object::{ObjectDiff, ObjectId, WhiteboardObject};

/// Key for the durable objects map in the document.
pub const OBJECTS_KEY: &str = "objects";
/// Key for the ephemeral objects map in the document.
pub const EPHEMERAL_KEY: &str = "ephemeral";

/// Errors from the shared document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("CRDT error: {0}")]
    Loro(#[from] LoroError),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The two top-level collections of a session document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Objects,
    Ephemeral,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Objects, Collection::Ephemeral];

    pub fn key(self) -> &'static str {
        match self {
            Collection::Objects => OBJECTS_KEY,
            Collection::Ephemeral => EPHEMERAL_KEY,
        }
    }

    /// The collection an object belongs in.
    pub fn for_object(object: &WhiteboardObject) -> Self {
        if object.metadata.is_ephemeral {
            Collection::Ephemeral
        } else {
            Collection::Objects
        }
    }

    pub fn other(self) -> Self {
        match self {
            Collection::Objects => Collection::Ephemeral,
            Collection::Ephemeral => Collection::Objects,
        }
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A local user edit.
    Local,
    /// The trusted agent-execution path.
    Agent,
    /// A delta received from a peer.
    Remote,
    /// The ephemeral reaper.
    Reaper,
    /// History undo/redo replay.
    Replay,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Agent => "agent",
            Origin::Remote => "remote",
            Origin::Reaper => "reaper",
            Origin::Replay => "replay",
        }
    }

    pub fn is_remote(self) -> bool {
        self == Origin::Remote
    }
}

/// One effective change to one key.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub collection: Collection,
    pub id: ObjectId,
    /// Value before the change (`None` if the key was absent).
    pub previous: Option<WhiteboardObject>,
    /// Value after the change (`None` if the key was deleted).
    pub value: Option<WhiteboardObject>,
    pub origin: Origin,
}

impl DocChange {
    pub fn is_create(&self) -> bool {
        self.previous.is_none() && self.value.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// A delta produced by a local commit, waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDelta {
    pub bytes: Vec<u8>,
    pub origin: Origin,
}

/// Plain-data view of both collections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BoardState {
    pub objects: BTreeMap<ObjectId, WhiteboardObject>,
    pub ephemeral: BTreeMap<ObjectId, WhiteboardObject>,
}

impl BoardState {
    pub fn collection(&self, collection: Collection) -> &BTreeMap<ObjectId, WhiteboardObject> {
        match collection {
            Collection::Objects => &self.objects,
            Collection::Ephemeral => &self.ephemeral,
        }
    }
}

/// Callback invoked for every effective change, local or remote.
pub type Observer = Box<dyn Fn(&DocChange) + Send + Sync>;

/// Handle returned by [`SharedDocument::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

fn read_object(doc: &LoroDoc, collection: Collection, id: &str) -> Option<WhiteboardObject> {
    let root = doc.get_map(collection.key());
    match root.get(id)? {
        ValueOrContainer::Container(Container::Map(map)) => match map.get_deep_value() {
            LoroValue::Map(fields) => object_from_loro(&fields).map(|mut object| {
                object.id = id.to_string();
                object
            }),
            _ => None,
        },
        _ => None,
    }
}

fn read_collection(doc: &LoroDoc, collection: Collection) -> BTreeMap<ObjectId, WhiteboardObject> {
    let mut result = BTreeMap::new();
    if let LoroValue::Map(map) = doc.get_map(collection.key()).get_deep_value() {
        for (id, value) in map.iter() {
            let LoroValue::Map(fields) = value else {
                continue;
            };
            match object_from_loro(fields) {
                Some(mut object) => {
                    object.id = id.clone();
                    result.insert(id.clone(), object);
                }
                None => log::warn!("Skipping undecodable {} entry {}", collection.key(), id),
            }
        }
    }
    result
}

fn diff_states(before: &BoardState, after: &BoardState, origin: Origin) -> Vec<DocChange> {
    let mut changes = Vec::new();
    for collection in Collection::ALL {
        let old = before.collection(collection);
        let new = after.collection(collection);
        for (id, previous) in old {
            match new.get(id) {
                Some(value) if value == previous => {}
                value => changes.push(DocChange {
                    collection,
                    id: id.clone(),
                    previous: Some(previous.clone()),
                    value: value.cloned(),
                    origin,
                }),
            }
        }
        for (id, value) in new {
            if !old.contains_key(id) {
                changes.push(DocChange {
                    collection,
                    id: id.clone(),
                    previous: None,
                    value: Some(value.clone()),
                    origin,
                });
            }
        }
    }
    changes
}

/// A group of edits committed together as one delta and one version bump.
pub struct Transaction<'a> {
    doc: &'a LoroDoc,
    touched: Vec<(Collection, ObjectId, Option<WhiteboardObject>)>,
}

impl Transaction<'_> {
    /// Read an object, including edits made earlier in this transaction.
    pub fn get(&self, collection: Collection, id: &str) -> Option<WhiteboardObject> {
        read_object(self.doc, collection, id)
    }

    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        self.doc.get_map(collection.key()).get(id).is_some()
    }

    /// All objects in a collection, ordered by id.
    pub fn objects(&self, collection: Collection) -> BTreeMap<ObjectId, WhiteboardObject> {
        read_collection(self.doc, collection)
    }

    fn touch(&mut self, collection: Collection, id: &str) {
        let seen = self
            .touched
            .iter()
            .any(|(c, touched_id, _)| *c == collection && touched_id == id);
        if !seen {
            let before = self.get(collection, id);
            self.touched.push((collection, id.to_string(), before));
        }
    }

    /// Insert or overwrite an object. Only fields that differ are written.
    pub fn set(&mut self, collection: Collection, object: &WhiteboardObject) -> StoreResult<()> {
        self.touch(collection, &object.id);
        let root = self.doc.get_map(collection.key());
        let map = root.get_or_create_container(&object.id, LoroMap::new())?;
        let current = match map.get_deep_value() {
            LoroValue::Map(fields) => Some(fields),
            _ => None,
        };

        for (key, value) in object_fields(object) {
            let existing = current.as_ref().and_then(|fields| fields.get(key));
            if value == LoroValue::Null {
                if existing.is_some() {
                    map.delete(key)?;
                }
            } else if existing != Some(&value) {
                map.insert(key, value)?;
            }
        }
        Ok(())
    }

    /// Put an object into the collection its metadata names.
    ///
    /// An id lives in one collection at a time, so a copy in the other
    /// collection is deleted.
    pub fn insert(&mut self, object: &WhiteboardObject) -> StoreResult<Collection> {
        let collection = Collection::for_object(object);
        if self.delete(collection.other(), &object.id)? {
            log::debug!("Moved {} into {}", object.id, collection.key());
        }
        self.set(collection, object)?;
        Ok(collection)
    }

    /// Merge a partial update into an existing object.
    pub fn update(
        &mut self,
        collection: Collection,
        id: &str,
        diff: &ObjectDiff,
    ) -> StoreResult<WhiteboardObject> {
        let mut object = self
            .get(collection, id)
            .ok_or_else(|| StoreError::UnknownObject(id.to_string()))?;
        diff.apply_to(&mut object);
        self.set(collection, &object)?;
        Ok(object)
    }

    /// Delete an object. Returns false if it did not exist.
    pub fn delete(&mut self, collection: Collection, id: &str) -> StoreResult<bool> {
        if !self.contains(collection, id) {
            return Ok(false);
        }
        self.touch(collection, id);
        self.doc.get_map(collection.key()).delete(id)?;
        Ok(true)
    }

    /// Delete every object in a collection. Returns the number removed.
    pub fn clear(&mut self, collection: Collection) -> StoreResult<usize> {
        let ids: Vec<ObjectId> = self.objects(collection).into_keys().collect();
        for id in &ids {
            self.delete(collection, id)?;
        }
        Ok(ids.len())
    }

    /// Put every touched key back to its value from before the transaction.
    fn rollback(&mut self) {
        let touched = self.touched.clone();
        for (collection, id, previous) in touched {
            let restored = match &previous {
                Some(object) => self.set(collection, object),
                None => self.delete(collection, &id).map(|_| ()),
            };
            if let Err(e) = restored {
                log::error!("Failed to roll back {} in {}: {}", id, collection.key(), e);
            }
        }
    }
}

/// A CRDT-backed session document.
///
/// Wraps a `LoroDoc` holding two maps, `objects` and `ephemeral`, keyed by
/// object id. Each object is a nested map with one key per leaf field, so the
/// merge is last-writer-wins per field (Lamport clock, then peer id).
///
/// Local edits go through [`SharedDocument::transact`] and queue a delta in
/// the outbox. Remote bytes go through [`SharedDocument::apply_remote_delta`]
/// and never reach the outbox.
pub struct SharedDocument {
    /// The underlying Loro document.
    doc: LoroDoc,
    /// Bumped once per commit or import that changed the board.
    version: u64,
    /// Local deltas not yet taken by the transport.
    outbox: Vec<LocalDelta>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer_id: u64,
}

impl SharedDocument {
    /// Create a new empty document with a random peer id.
    pub fn new() -> Self {
        Self::from_doc(LoroDoc::new())
    }

    /// Create an empty document with a fixed peer id.
    pub fn with_peer_id(peer_id: u64) -> StoreResult<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer_id)?;
        Ok(Self::from_doc(doc))
    }

    /// Create a document from a snapshot.
    pub fn from_snapshot(bytes: &[u8]) -> StoreResult<Self> {
        let doc = LoroDoc::new();
        doc.import(bytes)?;
        Ok(Self::from_doc(doc))
    }

    fn from_doc(doc: LoroDoc) -> Self {
        Self {
            doc,
            version: 0,
            outbox: Vec::new(),
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    /// Get the underlying LoroDoc.
    pub fn loro_doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    /// Monotonic change counter used for optimistic concurrency.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<WhiteboardObject> {
        read_object(&self.doc, collection, id)
    }

    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        self.doc.get_map(collection.key()).get(id).is_some()
    }

    /// Find an object in either collection.
    pub fn find(&self, id: &str) -> Option<(Collection, WhiteboardObject)> {
        Collection::ALL
            .into_iter()
            .find_map(|collection| self.get(collection, id).map(|object| (collection, object)))
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.doc.get_map(collection.key()).len()
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.into_iter().all(|c| self.len(c) == 0)
    }

    /// All objects in a collection, ordered by id.
    pub fn objects(&self, collection: Collection) -> BTreeMap<ObjectId, WhiteboardObject> {
        read_collection(&self.doc, collection)
    }

    pub fn board_state(&self) -> BoardState {
        BoardState {
            objects: self.objects(Collection::Objects),
            ephemeral: self.objects(Collection::Ephemeral),
        }
    }

    // --- Mutation ---

    /// Run `f` as one commit.
    ///
    /// Changes are computed for every key the transaction touched, observers
    /// are notified, and the commit is exported into the outbox. The outbox
    /// entry is written whenever the oplog advanced, even if the net effect
    /// was nil, so peers never miss a causal dependency.
    ///
    /// If `f` fails, every touched key is restored before the commit, so the
    /// board is left as it was and no change is reported.
    pub fn transact<F>(&mut self, origin: Origin, f: F) -> StoreResult<Vec<DocChange>>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<()>,
    {
        let before = self.doc.oplog_vv();
        let mut tx = Transaction { doc: &self.doc, touched: Vec::new() };
        let result = f(&mut tx);
        if result.is_err() {
            tx.rollback();
        }
        let touched = tx.touched;
        self.doc.commit();

        if self.doc.oplog_vv() != before {
            match self.doc.export(ExportMode::updates(&before)) {
                Ok(bytes) => self.outbox.push(LocalDelta { bytes, origin }),
                Err(e) => log::error!("Failed to export local delta: {}", e),
            }
        }

        let changes: Vec<DocChange> = touched
            .into_iter()
            .filter_map(|(collection, id, previous)| {
                let value = read_object(&self.doc, collection, &id);
                (previous != value).then_some(DocChange { collection, id, previous, value, origin })
            })
            .collect();

        if !changes.is_empty() {
            self.version += 1;
            self.notify(&changes);
        }

        result.map(|_| changes)
    }

    /// Insert or overwrite an object.
    pub fn set(
        &mut self,
        collection: Collection,
        object: &WhiteboardObject,
        origin: Origin,
    ) -> StoreResult<Vec<DocChange>> {
        self.transact(origin, |tx| tx.set(collection, object))
    }

    /// Merge a partial update into an existing object.
    pub fn update(
        &mut self,
        collection: Collection,
        id: &str,
        diff: &ObjectDiff,
        origin: Origin,
    ) -> StoreResult<Vec<DocChange>> {
        self.transact(origin, |tx| tx.update(collection, id, diff).map(|_| ()))
    }

    /// Delete an object. Deleting an absent key is a no-op.
    pub fn delete(
        &mut self,
        collection: Collection,
        id: &str,
        origin: Origin,
    ) -> StoreResult<Vec<DocChange>> {
        self.transact(origin, |tx| tx.delete(collection, id).map(|_| ()))
    }

    /// Delete every object in a collection.
    pub fn clear(&mut self, collection: Collection, origin: Origin) -> StoreResult<Vec<DocChange>> {
        self.transact(origin, |tx| tx.clear(collection).map(|_| ()))
    }

    /// Make a collection equal to `target`, touching only what differs.
    pub fn replace_collection(
        &mut self,
        collection: Collection,
        target: &BTreeMap<ObjectId, WhiteboardObject>,
        origin: Origin,
    ) -> StoreResult<Vec<DocChange>> {
        self.transact(origin, |tx| {
            let current = tx.objects(collection);
            for id in current.keys() {
                if !target.contains_key(id) {
                    tx.delete(collection, id)?;
                }
            }
            for (id, object) in target {
                if current.get(id) != Some(object) {
                    tx.set(collection, object)?;
                }
            }
            Ok(())
        })
    }

    // --- Sync ---

    /// Merge a delta received from elsewhere.
    ///
    /// Duplicate or already-known deltas produce no changes. The imported
    /// bytes are never queued in the outbox.
    pub fn apply_remote_delta(
        &mut self,
        bytes: &[u8],
        origin: Origin,
    ) -> StoreResult<Vec<DocChange>> {
        let before = self.board_state();
        self.doc.import(bytes)?;
        let after = self.board_state();

        let changes = diff_states(&before, &after, origin);
        if !changes.is_empty() {
            self.version += 1;
            self.notify(&changes);
        }
        Ok(changes)
    }

    /// Drain deltas produced by local commits.
    pub fn take_local_deltas(&mut self) -> Vec<LocalDelta> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_local_deltas(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Encoded version vector of everything this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Export the operations a peer with `state_vector` is missing.
    pub fn export_since(&self, state_vector: &[u8]) -> StoreResult<Vec<u8>> {
        let since = VersionVector::decode(state_vector)?;
        self.doc
            .export(ExportMode::updates(&since))
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    /// Export the document as a snapshot (full state).
    pub fn export_snapshot(&self) -> StoreResult<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    // --- Observers ---

    /// Register a callback for every effective change.
    pub fn subscribe(&mut self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    fn notify(&self, changes: &[DocChange]) {
        for (_, observer) in &self.observers {
            for change in changes {
                observer(change);
            }
        }
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}
