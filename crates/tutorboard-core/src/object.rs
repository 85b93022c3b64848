//! Whiteboard object model.
//!
//! A [`WhiteboardObject`] is a single visual primitive on the board. Its
//! geometry may be absolute, percentage-relative to the viewport, or anchored
//! to another object; see [`crate::coords`] for how the modes are resolved.

use kurbo::Rect;
use serde::{Deserialize, Serialize};

/// Caller-generated object identifier, stable across updates.
pub type ObjectId = String;

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    /// Default highlight color (amber).
    pub fn highlight() -> Self {
        Self::new(255, 193, 7, 255)
    }

    /// Pack into a single `0xRRGGBBAA` integer.
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes([self.r, self.g, self.b, self.a])
    }

    /// Unpack from a `0xRRGGBBAA` integer.
    pub fn from_u32(value: u32) -> Self {
        let [r, g, b, a] = value.to_be_bytes();
        Self { r, g, b, a }
    }
}

/// The kind of primitive, with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectKind {
    Rectangle,
    Ellipse,
    Text { content: String },
    Latex { source: String },
    GraphGroup { expression: String },
    RadioOption {
        label: String,
        #[serde(default)]
        selected: bool,
    },
    /// A remote peer's pointer. Lives in the ephemeral collection.
    Cursor { label: String },
}

impl ObjectKind {
    /// Stable tag used on the wire and in queries.
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Rectangle => "rectangle",
            ObjectKind::Ellipse => "ellipse",
            ObjectKind::Text { .. } => "text",
            ObjectKind::Latex { .. } => "latex",
            ObjectKind::GraphGroup { .. } => "graph_group",
            ObjectKind::RadioOption { .. } => "radio_option",
            ObjectKind::Cursor { .. } => "cursor",
        }
    }

    /// The textual payload of the kind, if it carries one.
    pub fn content(&self) -> Option<&str> {
        match self {
            ObjectKind::Rectangle | ObjectKind::Ellipse => None,
            ObjectKind::Text { content } => Some(content),
            ObjectKind::Latex { source } => Some(source),
            ObjectKind::GraphGroup { expression } => Some(expression),
            ObjectKind::RadioOption { label, .. } => Some(label),
            ObjectKind::Cursor { label } => Some(label),
        }
    }

    /// Replace the textual payload. Returns false for kinds without one.
    pub fn set_content(&mut self, value: String) -> bool {
        match self {
            ObjectKind::Rectangle | ObjectKind::Ellipse => false,
            ObjectKind::Text { content } => {
                *content = value;
                true
            }
            ObjectKind::Latex { source } => {
                *source = value;
                true
            }
            ObjectKind::GraphGroup { expression } => {
                *expression = value;
                true
            }
            ObjectKind::RadioOption { label, .. } | ObjectKind::Cursor { label } => {
                *label = value;
                true
            }
        }
    }

    /// Rebuild a kind from its tag and flattened payload.
    pub fn from_parts(name: &str, content: Option<String>, selected: bool) -> Option<Self> {
        let content = content.unwrap_or_default();
        Some(match name {
            "rectangle" => ObjectKind::Rectangle,
            "ellipse" => ObjectKind::Ellipse,
            "text" => ObjectKind::Text { content },
            "latex" => ObjectKind::Latex { source: content },
            "graph_group" => ObjectKind::GraphGroup { expression: content },
            "radio_option" => ObjectKind::RadioOption { label: content, selected },
            "cursor" => ObjectKind::Cursor { label: content },
            _ => return None,
        })
    }
}

/// Who authored an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    User,
    Assistant,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::User => "user",
            Source::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "assistant" => Source::Assistant,
            _ => Source::User,
        }
    }
}

/// Tutoring role of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectRole {
    Question,
    Option,
    Feedback,
    Hint,
    Diagram,
    #[serde(other)]
    Other,
}

impl ObjectRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectRole::Question => "question",
            ObjectRole::Option => "option",
            ObjectRole::Feedback => "feedback",
            ObjectRole::Hint => "hint",
            ObjectRole::Diagram => "diagram",
            ObjectRole::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "question" => ObjectRole::Question,
            "option" => ObjectRole::Option,
            "feedback" => ObjectRole::Feedback,
            "hint" => ObjectRole::Hint,
            "diagram" => ObjectRole::Diagram,
            _ => ObjectRole::Other,
        }
    }

    /// Decorations that live and die with a question.
    pub fn is_question_decoration(self) -> bool {
        matches!(self, ObjectRole::Option | ObjectRole::Feedback | ObjectRole::Hint)
    }
}

/// Horizontal edge selector for anchor placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeX {
    #[default]
    Left,
    Center,
    Right,
}

impl EdgeX {
    /// Fraction of the width at which this edge sits.
    pub fn factor(self) -> f64 {
        match self {
            EdgeX::Left => 0.0,
            EdgeX::Center => 0.5,
            EdgeX::Right => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeX::Left => "left",
            EdgeX::Center => "center",
            EdgeX::Right => "right",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "center" => EdgeX::Center,
            "right" => EdgeX::Right,
            _ => EdgeX::Left,
        }
    }
}

/// Vertical edge selector for anchor placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeY {
    #[default]
    Top,
    Middle,
    Bottom,
}

impl EdgeY {
    /// Fraction of the height at which this edge sits.
    pub fn factor(self) -> f64 {
        match self {
            EdgeY::Top => 0.0,
            EdgeY::Middle => 0.5,
            EdgeY::Bottom => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeY::Top => "top",
            EdgeY::Middle => "middle",
            EdgeY::Bottom => "bottom",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "middle" => EdgeY::Middle,
            "bottom" => EdgeY::Bottom,
            _ => EdgeY::Top,
        }
    }

    fn bottom() -> Self {
        EdgeY::Bottom
    }
}

/// Placement relative to another object's resolved bounds.
///
/// The point at (`anchor_edge_x`, `anchor_edge_y`) of the anchor is aligned
/// with the point at (`object_edge_x`, `object_edge_y`) of the dependent,
/// then shifted by the offsets (percent of the viewport). The defaults place
/// the dependent directly below the anchor, left-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorPlacement {
    pub anchor_id: ObjectId,
    #[serde(default)]
    pub anchor_edge_x: EdgeX,
    #[serde(default = "EdgeY::bottom")]
    pub anchor_edge_y: EdgeY,
    #[serde(default)]
    pub object_edge_x: EdgeX,
    #[serde(default)]
    pub object_edge_y: EdgeY,
    #[serde(default)]
    pub offset_x_pct: f64,
    #[serde(default)]
    pub offset_y_pct: f64,
}

impl AnchorPlacement {
    /// Place below `anchor_id`, left edges aligned.
    pub fn below(anchor_id: impl Into<ObjectId>) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            anchor_edge_x: EdgeX::Left,
            anchor_edge_y: EdgeY::Bottom,
            object_edge_x: EdgeX::Left,
            object_edge_y: EdgeY::Top,
            offset_x_pct: 0.0,
            offset_y_pct: 0.0,
        }
    }

    /// Place to the right of `anchor_id`, top edges aligned.
    pub fn right_of(anchor_id: impl Into<ObjectId>) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            anchor_edge_x: EdgeX::Right,
            anchor_edge_y: EdgeY::Top,
            object_edge_x: EdgeX::Left,
            object_edge_y: EdgeY::Top,
            offset_x_pct: 0.0,
            offset_y_pct: 0.0,
        }
    }

    pub fn with_offset(mut self, offset_x_pct: f64, offset_y_pct: f64) -> Self {
        self.offset_x_pct = offset_x_pct;
        self.offset_y_pct = offset_y_pct;
        self
    }
}

/// Object geometry.
///
/// `x`, `y`, `width` and `height` always hold the last resolved absolute
/// bounds. The percentage fields and `anchor`, when present, are the
/// authoritative inputs that get re-resolved against the viewport.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorPlacement>,
}

impl Geometry {
    pub fn absolute(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height, ..Default::default() }
    }

    pub fn percent(x_pct: f64, y_pct: f64, width_pct: f64, height_pct: f64) -> Self {
        Self {
            x_pct: Some(x_pct),
            y_pct: Some(y_pct),
            width_pct: Some(width_pct),
            height_pct: Some(height_pct),
            ..Default::default()
        }
    }

    /// Last resolved absolute bounds.
    pub fn bounds(&self) -> Rect {
        Rect::new(self.x, self.y, self.x + self.width, self.y + self.height)
    }

    /// Store freshly resolved bounds, keeping the relative inputs.
    pub fn set_resolved(&mut self, bounds: Rect) {
        self.x = bounds.x0;
        self.y = bounds.y0;
        self.width = bounds.width();
        self.height = bounds.height();
    }

    /// True if any field depends on the viewport or another object.
    pub fn is_relative(&self) -> bool {
        self.anchor.is_some()
            || self.x_pct.is_some()
            || self.y_pct.is_some()
            || self.width_pct.is_some()
            || self.height_pct.is_some()
    }
}

/// Drawing style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStyle {
    pub stroke_color: Rgba,
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<Rgba>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
}

impl Default for ObjectStyle {
    fn default() -> Self {
        Self {
            stroke_color: Rgba::black(),
            stroke_width: 2.0,
            fill_color: None,
            font_size: None,
        }
    }
}

/// Provenance and lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ObjectRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub is_ephemeral: bool,
    /// Expiry as unix milliseconds. Only meaningful for ephemeral objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// A visual primitive on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(default)]
    pub style: ObjectStyle,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

impl WhiteboardObject {
    /// Create an object with empty geometry and default style.
    pub fn new(id: impl Into<ObjectId>, kind: ObjectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            geometry: Geometry::default(),
            style: ObjectStyle::default(),
            metadata: ObjectMetadata::default(),
        }
    }

    pub fn text(id: impl Into<ObjectId>, content: impl Into<String>) -> Self {
        Self::new(id, ObjectKind::Text { content: content.into() })
    }

    pub fn rectangle(id: impl Into<ObjectId>) -> Self {
        Self::new(id, ObjectKind::Rectangle)
    }

    pub fn radio_option(id: impl Into<ObjectId>, label: impl Into<String>) -> Self {
        Self::new(id, ObjectKind::RadioOption { label: label.into(), selected: false })
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_bounds(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.geometry = Geometry::absolute(x, y, width, height);
        self
    }

    pub fn with_percent(mut self, x_pct: f64, y_pct: f64, width_pct: f64, height_pct: f64) -> Self {
        self.geometry = Geometry::percent(x_pct, y_pct, width_pct, height_pct);
        self
    }

    pub fn with_anchor(mut self, anchor: AnchorPlacement) -> Self {
        self.geometry.anchor = Some(anchor);
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.metadata.source = source;
        self
    }

    pub fn with_role(mut self, role: ObjectRole) -> Self {
        self.metadata.role = Some(role);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.metadata.group_id = Some(group_id.into());
        self
    }

    /// Mark as ephemeral, expiring at `expires_at` (unix millis).
    pub fn ephemeral(mut self, expires_at: u64) -> Self {
        self.metadata.is_ephemeral = true;
        self.metadata.expires_at = Some(expires_at);
        self
    }

    pub fn bounds(&self) -> Rect {
        self.geometry.bounds()
    }

    pub fn role(&self) -> Option<ObjectRole> {
        self.metadata.role
    }

    pub fn is_question(&self) -> bool {
        self.metadata.role == Some(ObjectRole::Question)
    }

    /// True once `now` is strictly past `expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.metadata.expires_at.is_some_and(|at| now > at)
    }

    pub fn anchor_id(&self) -> Option<&str> {
        self.geometry.anchor.as_ref().map(|a| a.anchor_id.as_str())
    }
}

/// A partial update to an object.
///
/// Geometry rules: an absolute position field clears the matching percentage
/// and any anchor; an absolute size field clears the matching percentage; a
/// percentage field is stored and re-resolved. The two representations never
/// silently disagree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorPlacement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<ObjectStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ObjectRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        *self == ObjectDiff::default()
    }

    /// True if applying this diff may move or resize the object.
    pub fn touches_geometry(&self) -> bool {
        self.x.is_some()
            || self.y.is_some()
            || self.width.is_some()
            || self.height.is_some()
            || self.x_pct.is_some()
            || self.y_pct.is_some()
            || self.width_pct.is_some()
            || self.height_pct.is_some()
            || self.anchor.is_some()
    }

    /// Apply onto `object` in place.
    pub fn apply_to(&self, object: &mut WhiteboardObject) {
        let g = &mut object.geometry;
        if let Some(x) = self.x {
            g.x = x;
            g.x_pct = None;
            g.anchor = None;
        }
        if let Some(y) = self.y {
            g.y = y;
            g.y_pct = None;
            g.anchor = None;
        }
        if let Some(width) = self.width {
            g.width = width;
            g.width_pct = None;
        }
        if let Some(height) = self.height {
            g.height = height;
            g.height_pct = None;
        }
        if self.x_pct.is_some() {
            g.x_pct = self.x_pct;
        }
        if self.y_pct.is_some() {
            g.y_pct = self.y_pct;
        }
        if self.width_pct.is_some() {
            g.width_pct = self.width_pct;
        }
        if self.height_pct.is_some() {
            g.height_pct = self.height_pct;
        }
        if let Some(anchor) = &self.anchor {
            g.anchor = Some(anchor.clone());
        }

        if let Some(content) = &self.content {
            if !object.kind.set_content(content.clone()) {
                log::debug!(
                    "Ignoring content update for {} object {}",
                    object.kind.name(),
                    object.id
                );
            }
        }
        if let Some(value) = self.selected {
            if let ObjectKind::RadioOption { selected, .. } = &mut object.kind {
                *selected = value;
            }
        }
        if let Some(style) = &self.style {
            object.style = style.clone();
        }

        let meta = &mut object.metadata;
        if let Some(source) = self.source {
            meta.source = source;
        }
        if self.role.is_some() {
            meta.role = self.role;
        }
        if self.group_id.is_some() {
            meta.group_id = self.group_id.clone();
        }
        if self.expires_at.is_some() {
            meta.expires_at = self.expires_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_parts() {
        let kinds = [
            ObjectKind::Rectangle,
            ObjectKind::Text { content: "x = 2".into() },
            ObjectKind::Latex { source: "\\frac{1}{2}".into() },
            ObjectKind::RadioOption { label: "A".into(), selected: true },
        ];
        for kind in kinds {
            let content = kind.content().map(str::to_string);
            let selected = matches!(kind, ObjectKind::RadioOption { selected: true, .. });
            assert_eq!(ObjectKind::from_parts(kind.name(), content, selected), Some(kind));
        }
        assert_eq!(ObjectKind::from_parts("hexagon", None, false), None);
    }

    #[test]
    fn test_absolute_update_clears_percent() {
        let mut obj = WhiteboardObject::rectangle("r").with_percent(10.0, 20.0, 30.0, 40.0);
        let diff = ObjectDiff { x: Some(5.0), width: Some(50.0), ..Default::default() };
        diff.apply_to(&mut obj);
        assert_eq!(obj.geometry.x, 5.0);
        assert_eq!(obj.geometry.x_pct, None);
        assert_eq!(obj.geometry.width_pct, None);
        // Untouched axes keep their percentages
        assert_eq!(obj.geometry.y_pct, Some(20.0));
        assert_eq!(obj.geometry.height_pct, Some(40.0));
    }

    #[test]
    fn test_absolute_position_detaches_anchor() {
        let mut obj = WhiteboardObject::text("t", "hi").with_anchor(AnchorPlacement::below("q"));
        ObjectDiff { y: Some(100.0), ..Default::default() }.apply_to(&mut obj);
        assert!(obj.geometry.anchor.is_none());
    }

    #[test]
    fn test_content_update_on_rectangle_is_ignored() {
        let mut obj = WhiteboardObject::rectangle("r");
        ObjectDiff { content: Some("nope".into()), ..Default::default() }.apply_to(&mut obj);
        assert_eq!(obj.kind, ObjectKind::Rectangle);
    }

    #[test]
    fn test_expiry_is_strict() {
        let obj = WhiteboardObject::new("c", ObjectKind::Cursor { label: "ana".into() })
            .ephemeral(1_000);
        assert!(!obj.is_expired(1_000));
        assert!(obj.is_expired(1_001));
    }

    #[test]
    fn test_object_json_shape() {
        let json = r#"{
            "id": "q1",
            "kind": { "type": "text", "content": "What is 2+2?" },
            "x_pct": 10, "y_pct": 5, "width_pct": 80, "height_pct": 10,
            "metadata": { "source": "assistant", "role": "question" }
        }"#;
        let obj: WhiteboardObject = serde_json::from_str(json).unwrap();
        assert_eq!(obj.id, "q1");
        assert!(obj.is_question());
        assert_eq!(obj.metadata.source, Source::Assistant);
        assert_eq!(obj.geometry.width_pct, Some(80.0));
        assert_eq!(obj.geometry.width, 0.0);
    }

    #[test]
    fn test_unknown_role_maps_to_other() {
        let role: ObjectRole = serde_json::from_str("\"scratchpad\"").unwrap();
        assert_eq!(role, ObjectRole::Other);
    }

    #[test]
    fn test_rgba_pack() {
        let c = Rgba::new(1, 2, 3, 4);
        assert_eq!(Rgba::from_u32(c.to_u32()), c);
        assert_eq!(c.to_u32(), 0x0102_0304);
    }
}
