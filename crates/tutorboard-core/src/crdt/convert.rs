//! Conversion between whiteboard objects and Loro values.
//!
//! Every leaf field of an object is its own key in the object's `LoroMap`,
//! so concurrent edits to different fields of the same object merge instead
//! of overwriting each other.

use loro::{LoroMapValue, LoroValue};

use crate::object::{
    AnchorPlacement, EdgeX, EdgeY, Geometry, ObjectKind, ObjectMetadata, ObjectRole, ObjectStyle,
    Rgba, Source, WhiteboardObject,
};

// Common keys
const KEY_ID: &str = "id";
const KEY_KIND: &str = "kind";
const KEY_CONTENT: &str = "content";
const KEY_SELECTED: &str = "selected";

// Geometry keys
const KEY_X: &str = "x";
const KEY_Y: &str = "y";
const KEY_WIDTH: &str = "width";
const KEY_HEIGHT: &str = "height";
const KEY_X_PCT: &str = "x_pct";
const KEY_Y_PCT: &str = "y_pct";
const KEY_WIDTH_PCT: &str = "width_pct";
const KEY_HEIGHT_PCT: &str = "height_pct";

// Anchor keys
const KEY_ANCHOR_ID: &str = "anchor_id";
const KEY_ANCHOR_EDGE_X: &str = "anchor_edge_x";
const KEY_ANCHOR_EDGE_Y: &str = "anchor_edge_y";
const KEY_OBJECT_EDGE_X: &str = "object_edge_x";
const KEY_OBJECT_EDGE_Y: &str = "object_edge_y";
const KEY_OFFSET_X_PCT: &str = "offset_x_pct";
const KEY_OFFSET_Y_PCT: &str = "offset_y_pct";

// Style keys
const KEY_STROKE_COLOR: &str = "stroke_color";
const KEY_STROKE_WIDTH: &str = "stroke_width";
const KEY_FILL_COLOR: &str = "fill_color";
const KEY_FONT_SIZE: &str = "font_size";

// Metadata keys
const KEY_SOURCE: &str = "source";
const KEY_ROLE: &str = "role";
const KEY_GROUP_ID: &str = "group_id";
const KEY_IS_EPHEMERAL: &str = "is_ephemeral";
const KEY_EXPIRES_AT: &str = "expires_at";

/// Every key an object map may hold, in write order.
pub const OBJECT_KEYS: &[&str] = &[
    KEY_ID,
    KEY_KIND,
    KEY_CONTENT,
    KEY_SELECTED,
    KEY_X,
    KEY_Y,
    KEY_WIDTH,
    KEY_HEIGHT,
    KEY_X_PCT,
    KEY_Y_PCT,
    KEY_WIDTH_PCT,
    KEY_HEIGHT_PCT,
    KEY_ANCHOR_ID,
    KEY_ANCHOR_EDGE_X,
    KEY_ANCHOR_EDGE_Y,
    KEY_OBJECT_EDGE_X,
    KEY_OBJECT_EDGE_Y,
    KEY_OFFSET_X_PCT,
    KEY_OFFSET_Y_PCT,
    KEY_STROKE_COLOR,
    KEY_STROKE_WIDTH,
    KEY_FILL_COLOR,
    KEY_FONT_SIZE,
    KEY_SOURCE,
    KEY_ROLE,
    KEY_GROUP_ID,
    KEY_IS_EPHEMERAL,
    KEY_EXPIRES_AT,
];

// Helper functions to extract values from LoroMapValue (derefs to HashMap<String, LoroValue>)
fn get_double(map: &LoroMapValue, key: &str) -> Option<f64> {
    match map.get(key)? {
        LoroValue::Double(d) => Some(*d),
        LoroValue::I64(i) => Some(*i as f64),
        _ => None,
    }
}

fn get_i64(map: &LoroMapValue, key: &str) -> Option<i64> {
    match map.get(key)? {
        LoroValue::I64(i) => Some(*i),
        LoroValue::Double(d) => Some(*d as i64),
        _ => None,
    }
}

fn get_string(map: &LoroMapValue, key: &str) -> Option<String> {
    match map.get(key)? {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn get_bool(map: &LoroMapValue, key: &str) -> Option<bool> {
    match map.get(key)? {
        LoroValue::Bool(b) => Some(*b),
        _ => None,
    }
}

fn opt<T: Into<LoroValue>>(value: Option<T>) -> LoroValue {
    value.map(Into::into).unwrap_or(LoroValue::Null)
}

/// Flatten an object into `(key, value)` pairs.
///
/// Absent optional fields map to `LoroValue::Null`, which the writer turns
/// into a key deletion.
pub fn object_fields(object: &WhiteboardObject) -> Vec<(&'static str, LoroValue)> {
    let g = &object.geometry;
    let s = &object.style;
    let m = &object.metadata;
    let selected = match object.kind {
        ObjectKind::RadioOption { selected, .. } => Some(selected),
        _ => None,
    };
    let anchor = g.anchor.as_ref();

    vec![
        (KEY_ID, object.id.clone().into()),
        (KEY_KIND, object.kind.name().into()),
        (KEY_CONTENT, opt(object.kind.content().map(str::to_string))),
        (KEY_SELECTED, opt(selected)),
        (KEY_X, g.x.into()),
        (KEY_Y, g.y.into()),
        (KEY_WIDTH, g.width.into()),
        (KEY_HEIGHT, g.height.into()),
        (KEY_X_PCT, opt(g.x_pct)),
        (KEY_Y_PCT, opt(g.y_pct)),
        (KEY_WIDTH_PCT, opt(g.width_pct)),
        (KEY_HEIGHT_PCT, opt(g.height_pct)),
        (KEY_ANCHOR_ID, opt(anchor.map(|a| a.anchor_id.clone()))),
        (KEY_ANCHOR_EDGE_X, opt(anchor.map(|a| a.anchor_edge_x.as_str()))),
        (KEY_ANCHOR_EDGE_Y, opt(anchor.map(|a| a.anchor_edge_y.as_str()))),
        (KEY_OBJECT_EDGE_X, opt(anchor.map(|a| a.object_edge_x.as_str()))),
        (KEY_OBJECT_EDGE_Y, opt(anchor.map(|a| a.object_edge_y.as_str()))),
        (KEY_OFFSET_X_PCT, opt(anchor.map(|a| a.offset_x_pct))),
        (KEY_OFFSET_Y_PCT, opt(anchor.map(|a| a.offset_y_pct))),
        (KEY_STROKE_COLOR, (s.stroke_color.to_u32() as i64).into()),
        (KEY_STROKE_WIDTH, s.stroke_width.into()),
        (KEY_FILL_COLOR, opt(s.fill_color.map(|c| c.to_u32() as i64))),
        (KEY_FONT_SIZE, opt(s.font_size)),
        (KEY_SOURCE, m.source.as_str().into()),
        (KEY_ROLE, opt(m.role.map(ObjectRole::as_str))),
        (KEY_GROUP_ID, opt(m.group_id.clone())),
        (KEY_IS_EPHEMERAL, m.is_ephemeral.into()),
        (KEY_EXPIRES_AT, opt(m.expires_at.map(|at| at as i64))),
    ]
}

/// Rebuild an object from its Loro map value.
///
/// Returns `None` if the map lacks an id or has an unknown kind. Missing
/// optional fields fall back to defaults.
pub fn object_from_loro(map: &LoroMapValue) -> Option<WhiteboardObject> {
    let id = get_string(map, KEY_ID)?;
    let kind_name = get_string(map, KEY_KIND)?;
    let kind = ObjectKind::from_parts(
        &kind_name,
        get_string(map, KEY_CONTENT),
        get_bool(map, KEY_SELECTED).unwrap_or(false),
    )?;

    let anchor = get_string(map, KEY_ANCHOR_ID).map(|anchor_id| AnchorPlacement {
        anchor_id,
        anchor_edge_x: get_string(map, KEY_ANCHOR_EDGE_X)
            .map(|v| EdgeX::parse(&v))
            .unwrap_or_default(),
        anchor_edge_y: get_string(map, KEY_ANCHOR_EDGE_Y)
            .map(|v| EdgeY::parse(&v))
            .unwrap_or(EdgeY::Bottom),
        object_edge_x: get_string(map, KEY_OBJECT_EDGE_X)
            .map(|v| EdgeX::parse(&v))
            .unwrap_or_default(),
        object_edge_y: get_string(map, KEY_OBJECT_EDGE_Y)
            .map(|v| EdgeY::parse(&v))
            .unwrap_or_default(),
        offset_x_pct: get_double(map, KEY_OFFSET_X_PCT).unwrap_or(0.0),
        offset_y_pct: get_double(map, KEY_OFFSET_Y_PCT).unwrap_or(0.0),
    });

    let geometry = Geometry {
        x: get_double(map, KEY_X).unwrap_or(0.0),
        y: get_double(map, KEY_Y).unwrap_or(0.0),
        width: get_double(map, KEY_WIDTH).unwrap_or(0.0),
        height: get_double(map, KEY_HEIGHT).unwrap_or(0.0),
        x_pct: get_double(map, KEY_X_PCT),
        y_pct: get_double(map, KEY_Y_PCT),
        width_pct: get_double(map, KEY_WIDTH_PCT),
        height_pct: get_double(map, KEY_HEIGHT_PCT),
        anchor,
    };

    let defaults = ObjectStyle::default();
    let style = ObjectStyle {
        stroke_color: get_i64(map, KEY_STROKE_COLOR)
            .map(|c| Rgba::from_u32(c as u32))
            .unwrap_or(defaults.stroke_color),
        stroke_width: get_double(map, KEY_STROKE_WIDTH).unwrap_or(defaults.stroke_width),
        fill_color: get_i64(map, KEY_FILL_COLOR).map(|c| Rgba::from_u32(c as u32)),
        font_size: get_double(map, KEY_FONT_SIZE),
    };

    let metadata = ObjectMetadata {
        source: get_string(map, KEY_SOURCE).map(|s| Source::parse(&s)).unwrap_or_default(),
        role: get_string(map, KEY_ROLE).map(|r| ObjectRole::parse(&r)),
        group_id: get_string(map, KEY_GROUP_ID),
        is_ephemeral: get_bool(map, KEY_IS_EPHEMERAL).unwrap_or(false),
        expires_at: get_i64(map, KEY_EXPIRES_AT).map(|at| at.max(0) as u64),
    };

    Some(WhiteboardObject { id, kind, geometry, style, metadata })
}
