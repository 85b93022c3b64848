//! Coordinate resolution.
//!
//! Converts mixed absolute / percentage / anchor-relative geometry into
//! absolute canvas bounds for the current viewport.
//!
//! Resolution order:
//! 1. If an anchor is set and the anchor resolves, the position comes from the
//!    anchor's current bounds. If the anchor is gone, the last resolved
//!    absolute position is used instead.
//! 2. Otherwise, per axis, a percentage field overrides the absolute one.
//!
//! Sizes always follow rule 2.

use std::collections::{BTreeMap, HashMap, HashSet};

use kurbo::{Rect, Size};

use crate::object::{Geometry, ObjectId, WhiteboardObject};

/// Percentages are expressed on a 0–100 scale.
pub const PERCENT_SCALE: f64 = 100.0;

/// Convert a percentage of `extent` to an absolute length.
pub fn percent_of(pct: f64, extent: f64) -> f64 {
    pct * extent / PERCENT_SCALE
}

/// Convert an absolute length to a percentage of `extent`.
/// A degenerate extent maps to 0.
pub fn to_percent(value: f64, extent: f64) -> f64 {
    if extent.abs() < f64::EPSILON {
        0.0
    } else {
        value * PERCENT_SCALE / extent
    }
}

fn axis(pct: Option<f64>, absolute: f64, extent: f64) -> f64 {
    match pct {
        Some(pct) => percent_of(pct, extent),
        None => absolute,
    }
}

/// Resolve `geometry` against `viewport`.
///
/// `anchor_bounds` looks up the current resolved bounds of an anchor by id.
pub fn resolve<F>(geometry: &Geometry, viewport: Size, anchor_bounds: F) -> Rect
where
    F: Fn(&str) -> Option<Rect>,
{
    let width = axis(geometry.width_pct, geometry.width, viewport.width);
    let height = axis(geometry.height_pct, geometry.height, viewport.height);

    if let Some(anchor) = &geometry.anchor {
        return match anchor_bounds(&anchor.anchor_id) {
            Some(target) => {
                let ax = target.x0 + anchor.anchor_edge_x.factor() * target.width();
                let ay = target.y0 + anchor.anchor_edge_y.factor() * target.height();
                let x = ax - anchor.object_edge_x.factor() * width
                    + percent_of(anchor.offset_x_pct, viewport.width);
                let y = ay - anchor.object_edge_y.factor() * height
                    + percent_of(anchor.offset_y_pct, viewport.height);
                Rect::new(x, y, x + width, y + height)
            }
            None => Rect::new(geometry.x, geometry.y, geometry.x + width, geometry.y + height),
        };
    }

    let x = axis(geometry.x_pct, geometry.x, viewport.width);
    let y = axis(geometry.y_pct, geometry.y, viewport.height);
    Rect::new(x, y, x + width, y + height)
}

/// Resolves whole boards, honoring anchor dependencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateResolver {
    viewport: Size,
}

impl CoordinateResolver {
    pub fn new(viewport: Size) -> Self {
        Self { viewport }
    }

    pub fn viewport(&self) -> Size {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Size) {
        self.viewport = viewport;
    }

    /// Resolve a single geometry with an explicit anchor lookup.
    pub fn resolve<F>(&self, geometry: &Geometry, anchor_bounds: F) -> Rect
    where
        F: Fn(&str) -> Option<Rect>,
    {
        resolve(geometry, self.viewport, anchor_bounds)
    }

    /// Resolve every object, anchors before their dependents.
    ///
    /// Anchor cycles are broken by treating the anchor that closes the cycle
    /// as missing, which falls back to the last resolved absolute position.
    pub fn resolve_all(
        &self,
        objects: &BTreeMap<ObjectId, WhiteboardObject>,
    ) -> HashMap<ObjectId, Rect> {
        let mut resolved = HashMap::with_capacity(objects.len());
        let mut visiting = HashSet::new();
        for id in objects.keys() {
            self.resolve_into(id, objects, &mut resolved, &mut visiting);
        }
        resolved
    }

    fn resolve_into(
        &self,
        id: &str,
        objects: &BTreeMap<ObjectId, WhiteboardObject>,
        resolved: &mut HashMap<ObjectId, Rect>,
        visiting: &mut HashSet<ObjectId>,
    ) -> Option<Rect> {
        if let Some(rect) = resolved.get(id) {
            return Some(*rect);
        }
        let object = objects.get(id)?;
        if !visiting.insert(id.to_string()) {
            log::warn!("Anchor cycle through {}, using last resolved position", id);
            return None;
        }

        let anchor_rect = match object.anchor_id() {
            Some(anchor_id) => self.resolve_into(anchor_id, objects, resolved, visiting),
            None => None,
        };
        let rect = resolve(&object.geometry, self.viewport, |_| anchor_rect);

        visiting.remove(id);
        resolved.insert(id.to_string(), rect);
        Some(rect)
    }
}

/// Ids of every object that transitively anchors to `id`.
pub fn dependents_of(objects: &BTreeMap<ObjectId, WhiteboardObject>, id: &str) -> Vec<ObjectId> {
    let mut result = Vec::new();
    let mut frontier = vec![id.to_string()];
    let mut seen: HashSet<ObjectId> = HashSet::from([id.to_string()]);
    while let Some(current) = frontier.pop() {
        for object in objects.values() {
            if object.anchor_id() == Some(current.as_str()) && seen.insert(object.id.clone()) {
                result.push(object.id.clone());
                frontier.push(object.id.clone());
            }
        }
    }
    result
}
