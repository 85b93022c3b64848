//! Whiteboard actions and batches.
//!
//! Actions are the unit both the user interface and the AI agent speak. A
//! batch of actions is applied atomically and recorded as one history entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::crdt::StoreError;
use crate::object::{ObjectDiff, ObjectId, ObjectRole, Rgba, WhiteboardObject};

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid action at index {index}: {message}")]
    InvalidAction { index: usize, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Batch {0} is still in flight")]
    BatchInFlight(Uuid),
    #[error("No batch in flight")]
    NoBatchInFlight,
}

/// A partial update addressed to one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub id: ObjectId,
    #[serde(flatten)]
    pub diff: ObjectDiff,
}

/// One whiteboard action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhiteboardAction {
    AddObjects {
        objects: Vec<WhiteboardObject>,
    },
    UpdateObjects {
        updates: Vec<ObjectUpdate>,
    },
    DeleteObjects {
        ids: Vec<ObjectId>,
    },
    /// Remove every durable object, or only those matching the filters.
    ClearBoard {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<ObjectRole>,
        /// Object kind name, e.g. `"text"`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    /// Render-only emphasis that expires on its own.
    HighlightObject {
        id: ObjectId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<Rgba>,
    },
    GroupObjects {
        ids: Vec<ObjectId>,
        group_id: String,
    },
    /// Translate every member of a group by an absolute offset.
    MoveGroup {
        group_id: String,
        #[serde(default)]
        dx: f64,
        #[serde(default)]
        dy: f64,
    },
    DeleteGroup {
        group_id: String,
    },
}

impl WhiteboardAction {
    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            WhiteboardAction::AddObjects { .. } => "ADD_OBJECTS",
            WhiteboardAction::UpdateObjects { .. } => "UPDATE_OBJECTS",
            WhiteboardAction::DeleteObjects { .. } => "DELETE_OBJECTS",
            WhiteboardAction::ClearBoard { .. } => "CLEAR_BOARD",
            WhiteboardAction::HighlightObject { .. } => "HIGHLIGHT_OBJECT",
            WhiteboardAction::GroupObjects { .. } => "GROUP_OBJECTS",
            WhiteboardAction::MoveGroup { .. } => "MOVE_GROUP",
            WhiteboardAction::DeleteGroup { .. } => "DELETE_GROUP",
        }
    }

    /// True if the action can change the durable board.
    pub fn mutates_store(&self) -> bool {
        !matches!(self, WhiteboardAction::HighlightObject { .. })
    }
}

/// Who produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOrigin {
    User,
    Ai,
}

/// An ordered list of actions applied as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBatch {
    pub id: Uuid,
    pub origin: BatchOrigin,
    pub actions: Vec<WhiteboardAction>,
}

impl ActionBatch {
    pub fn new(origin: BatchOrigin, actions: Vec<WhiteboardAction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            actions,
        }
    }

    pub fn user(actions: Vec<WhiteboardAction>) -> Self {
        Self::new(BatchOrigin::User, actions)
    }

    pub fn ai(actions: Vec<WhiteboardAction>) -> Self {
        Self::new(BatchOrigin::Ai, actions)
    }

    pub fn is_ai(&self) -> bool {
        self.origin == BatchOrigin::Ai
    }
}

/// Parse an action stream payload: a single action object or an array.
///
/// Unknown `type` tags are rejected here, before anything is dispatched.
pub fn parse_actions(json: &str) -> Result<Vec<WhiteboardAction>, DispatchError> {
    let value: Value = serde_json::from_str(json)?;
    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item).map_err(|e| DispatchError::InvalidAction {
                index,
                message: e.to_string(),
            })
        })
        .collect()
}
