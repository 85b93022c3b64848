//! Tutorboard Core Library
//!
//! Platform-agnostic engine for the Tutorboard collaborative whiteboard: the
//! CRDT-backed shared document, sync protocol, action dispatch, history and
//! the patch API used by the agent-execution path.

pub mod actions;
pub mod collaboration;
pub mod coords;
pub mod crdt;
pub mod dispatcher;
pub mod history;
pub mod object;
pub mod patch;
pub mod reaper;
pub mod render;
pub mod session;
pub mod storage;
pub mod sync;
pub mod validate;

pub use actions::{
    parse_actions, ActionBatch, BatchOrigin, DispatchError, ObjectUpdate, WhiteboardAction,
};
pub use collaboration::{Backoff, CollaborationManager, SyncPhase};
pub use coords::CoordinateResolver;
pub use crdt::{
    BoardState, Collection, DocChange, LocalDelta, Origin, SharedDocument, StoreError, StoreResult,
};
pub use dispatcher::{ActionDispatcher, DispatchReport, DispatchState};
pub use history::{HistoryError, HistoryManager, HistorySnapshot};
pub use object::{
    AnchorPlacement, EdgeX, EdgeY, Geometry, ObjectDiff, ObjectId, ObjectKind, ObjectMetadata,
    ObjectRole,
    ObjectStyle, Rgba, Source, WhiteboardObject,
};
pub use patch::{apply_patch, find_objects, summarize, ObjectQuery, Patch, PatchIssue, PatchResult};
pub use reaper::{now_millis, EphemeralReaper};
pub use render::{BoardRenderer, NullRenderer, RecordingRenderer, RenderCommand};
pub use session::{BoardSession, SessionConfig, SessionError};
pub use storage::{FileStorage, MemoryStorage, SnapshotStorage, StorageError, StorageResult};
pub use sync::{
    ClientMessage, CloseReason, Connection, ConnectionState, MemoryConnection, NativeWebSocket,
    ServerMessage, SyncEvent,
    TransportError,
};
pub use validate::{ContentValidator, Provenance, ValidationError};
