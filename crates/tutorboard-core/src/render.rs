//! Renderer seam.
//!
//! The engine never draws. It tells a [`BoardRenderer`] which objects exist
//! and where, with bounds already resolved for the current viewport.

use kurbo::Rect;

use crate::object::{ObjectId, Rgba, WhiteboardObject};

/// Receives the render projection of the board.
pub trait BoardRenderer {
    fn create_object(&mut self, object: &WhiteboardObject, bounds: Rect);

    fn update_object(&mut self, object: &WhiteboardObject, bounds: Rect);

    fn delete_object(&mut self, id: &str);

    fn highlight_object(&mut self, id: &str, bounds: Rect, color: Rgba);

    fn clear_highlight(&mut self, id: &str);

    /// Drop everything drawn so far.
    fn clear(&mut self);
}

/// A renderer that draws nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl BoardRenderer for NullRenderer {
    fn create_object(&mut self, _object: &WhiteboardObject, _bounds: Rect) {}
    fn update_object(&mut self, _object: &WhiteboardObject, _bounds: Rect) {}
    fn delete_object(&mut self, _id: &str) {}
    fn highlight_object(&mut self, _id: &str, _bounds: Rect, _color: Rgba) {}
    fn clear_highlight(&mut self, _id: &str) {}
    fn clear(&mut self) {}
}

/// One call made on a [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    Create { id: ObjectId, bounds: Rect },
    Update { id: ObjectId, bounds: Rect },
    Delete { id: ObjectId },
    Highlight { id: ObjectId, bounds: Rect, color: Rgba },
    ClearHighlight { id: ObjectId },
    Clear,
}

impl RenderCommand {
    /// The object the command targets, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            RenderCommand::Create { id, .. }
            | RenderCommand::Update { id, .. }
            | RenderCommand::Delete { id }
            | RenderCommand::Highlight { id, .. }
            | RenderCommand::ClearHighlight { id } => Some(id),
            RenderCommand::Clear => None,
        }
    }
}

/// A renderer that records every call, for headless hosts and tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingRenderer {
    pub commands: Vec<RenderCommand>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<RenderCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl BoardRenderer for RecordingRenderer {
    fn create_object(&mut self, object: &WhiteboardObject, bounds: Rect) {
        self.commands.push(RenderCommand::Create { id: object.id.clone(), bounds });
    }

    fn update_object(&mut self, object: &WhiteboardObject, bounds: Rect) {
        self.commands.push(RenderCommand::Update { id: object.id.clone(), bounds });
    }

    fn delete_object(&mut self, id: &str) {
        self.commands.push(RenderCommand::Delete { id: id.to_string() });
    }

    fn highlight_object(&mut self, id: &str, bounds: Rect, color: Rgba) {
        self.commands.push(RenderCommand::Highlight {
            id: id.to_string(),
            bounds,
            color,
        });
    }

    fn clear_highlight(&mut self, id: &str) {
        self.commands.push(RenderCommand::ClearHighlight { id: id.to_string() });
    }

    fn clear(&mut self) {
        self.commands.push(RenderCommand::Clear);
    }
}
