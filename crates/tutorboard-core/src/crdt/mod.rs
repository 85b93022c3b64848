//! CRDT integration using Loro for collaborative editing.
//!
//! This module provides the bridge between the whiteboard object model and
//! Loro's CRDT document.
//!
//! # Schema
//!
//! The Loro document has the following structure:
//! ```text
//! LoroDoc
//! ├── "objects": LoroMap<ObjectId, LoroMap> (durable board content)
//! └── "ephemeral": LoroMap<ObjectId, LoroMap> (cursors, highlights, previews)
//! ```
//!
//! Each object is a LoroMap with one key per leaf field:
//! - "id", "kind", "content", "selected"
//! - Geometry fields ("x", "y", "width", "height", "x_pct", ..., "anchor_*")
//! - Style fields ("stroke_color", "stroke_width", "fill_color", "font_size")
//! - Metadata fields ("source", "role", "group_id", "is_ephemeral", "expires_at")
//!
//! Concurrent writes to different fields of one object both survive.
//! Concurrent writes to the same field resolve by Loro's last-writer-wins.

mod convert;
mod schema;

pub use convert::{object_fields, object_from_loro, OBJECT_KEYS};
pub use schema::{
    BoardState, Collection, DocChange, LocalDelta, Observer, ObserverId, Origin, SharedDocument,
    StoreError,
    StoreResult, Transaction, EPHEMERAL_KEY, OBJECTS_KEY,
};

// Re-export Loro types that may be useful for collaboration
pub use loro::{ExportMode, VersionVector};
