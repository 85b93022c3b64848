//! Content validation for objects entering the store.
//!
//! Everything that did not come from the trusted agent-execution path is
//! untrusted: user batches, patch requests from the network, and deltas
//! imported from peers. Untrusted input never keeps `source = assistant`.

use thiserror::Error;

use crate::crdt::{Collection, DocChange, Origin, SharedDocument, StoreResult};
use crate::object::{Geometry, ObjectDiff, ObjectKind, Source, WhiteboardObject};

/// Default maximum length of an object id, in bytes.
pub const DEFAULT_MAX_ID_LEN: usize = 128;
/// Default maximum length of textual content, in characters.
pub const DEFAULT_MAX_TEXT_LEN: usize = 4096;

/// Lowest accepted percentage value.
pub const MIN_PERCENT: f64 = -100.0;
/// Highest accepted percentage value.
pub const MAX_PERCENT: f64 = 200.0;

/// What a peer may change on an assistant object: its placement and its
/// selection state. Everything else stays as the assistant wrote it.
fn peer_edit_of_assistant(
    previous: &WhiteboardObject,
    value: &WhiteboardObject,
) -> WhiteboardObject {
    let mut kept = previous.clone();
    kept.geometry = value.geometry.clone();
    if let ObjectKind::RadioOption { selected, .. } = &mut kept.kind {
        if let ObjectKind::RadioOption { selected: chosen, .. } = &value.kind {
            *selected = *chosen;
        }
    }
    kept
}

/// Who is submitting the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Network input, user batches, imported deltas.
    Untrusted,
    /// The local agent-execution path.
    TrustedAgent,
}

/// Validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Object id is empty")]
    EmptyId,
    #[error("Object id is {len} bytes, limit is {max}")]
    IdTooLong { len: usize, max: usize },
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

fn size(value: f64) -> f64 {
    finite_or_zero(value).max(0.0)
}

fn percent(value: f64) -> Option<f64> {
    value.is_finite().then(|| value.clamp(MIN_PERCENT, MAX_PERCENT))
}

fn sanitize_geometry(geometry: &mut Geometry) {
    geometry.x = finite_or_zero(geometry.x);
    geometry.y = finite_or_zero(geometry.y);
    geometry.width = size(geometry.width);
    geometry.height = size(geometry.height);
    geometry.x_pct = geometry.x_pct.and_then(percent);
    geometry.y_pct = geometry.y_pct.and_then(percent);
    geometry.width_pct = geometry.width_pct.and_then(percent).map(|v| v.max(0.0));
    geometry.height_pct = geometry.height_pct.and_then(percent).map(|v| v.max(0.0));
    if let Some(anchor) = &mut geometry.anchor {
        anchor.offset_x_pct = percent(anchor.offset_x_pct).unwrap_or(0.0);
        anchor.offset_y_pct = percent(anchor.offset_y_pct).unwrap_or(0.0);
    }
}

/// Sanitizes objects and diffs before they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentValidator {
    pub max_id_len: usize,
    pub max_text_len: usize,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self {
            max_id_len: DEFAULT_MAX_ID_LEN,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

impl ContentValidator {
    pub fn new(max_id_len: usize, max_text_len: usize) -> Self {
        Self { max_id_len, max_text_len }
    }

    pub fn check_id(&self, id: &str) -> Result<(), ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if id.len() > self.max_id_len {
            return Err(ValidationError::IdTooLong {
                len: id.len(),
                max: self.max_id_len,
            });
        }
        Ok(())
    }

    fn truncate(&self, text: &str) -> Option<String> {
        (text.chars().count() > self.max_text_len)
            .then(|| text.chars().take(self.max_text_len).collect())
    }

    /// Return a cleaned copy of `object`, or reject it.
    pub fn sanitize(
        &self,
        object: &WhiteboardObject,
        provenance: Provenance,
    ) -> Result<WhiteboardObject, ValidationError> {
        self.check_id(&object.id)?;
        let mut clean = object.clone();

        if provenance == Provenance::Untrusted {
            clean.metadata.source = Source::User;
        }
        sanitize_geometry(&mut clean.geometry);

        if let Some(truncated) = clean.kind.content().and_then(|c| self.truncate(c)) {
            log::warn!("Truncating content of {} to {} chars", clean.id, self.max_text_len);
            clean.kind.set_content(truncated);
        }

        let style = &mut clean.style;
        style.stroke_width = size(style.stroke_width);
        style.font_size = style.font_size.map(size);

        if !clean.metadata.is_ephemeral {
            clean.metadata.expires_at = None;
        }
        Ok(clean)
    }

    /// Return a cleaned copy of a partial update.
    pub fn sanitize_diff(&self, diff: &ObjectDiff, provenance: Provenance) -> ObjectDiff {
        let mut clean = diff.clone();
        if provenance == Provenance::Untrusted && clean.source == Some(Source::Assistant) {
            clean.source = Some(Source::User);
        }

        clean.x = clean.x.filter(|v| v.is_finite());
        clean.y = clean.y.filter(|v| v.is_finite());
        clean.width = clean.width.filter(|v| v.is_finite()).map(|v| v.max(0.0));
        clean.height = clean.height.filter(|v| v.is_finite()).map(|v| v.max(0.0));
        clean.x_pct = clean.x_pct.and_then(percent);
        clean.y_pct = clean.y_pct.and_then(percent);
        clean.width_pct = clean.width_pct.and_then(percent).map(|v| v.max(0.0));
        clean.height_pct = clean.height_pct.and_then(percent).map(|v| v.max(0.0));
        if let Some(anchor) = &mut clean.anchor {
            anchor.offset_x_pct = percent(anchor.offset_x_pct).unwrap_or(0.0);
            anchor.offset_y_pct = percent(anchor.offset_y_pct).unwrap_or(0.0);
        }
        if let Some(content) = &clean.content {
            if let Some(truncated) = self.truncate(content) {
                clean.content = Some(truncated);
            }
        }
        if let Some(style) = &mut clean.style {
            style.stroke_width = size(style.stroke_width);
            style.font_size = style.font_size.map(size);
        }
        clean
    }

    /// Repair objects written by an untrusted import.
    ///
    /// Any object whose `source` the import turned into `assistant` is
    /// rewritten to `user`; other fields are sanitized and objects with
    /// invalid ids are removed. Corrections are committed with
    /// [`Origin::Local`] so they replicate to every peer, the sender included.
    pub fn repair_import(
        &self,
        store: &mut SharedDocument,
        changes: &[DocChange],
    ) -> StoreResult<Vec<DocChange>> {
        let mut fixes: Vec<(Collection, Option<WhiteboardObject>, String)> = Vec::new();
        for change in changes {
            let Some(value) = &change.value else {
                continue;
            };
            if self.check_id(&change.id).is_err() {
                log::warn!("Removing imported object with invalid id ({} bytes)", change.id.len());
                fixes.push((change.collection, None, change.id.clone()));
                continue;
            }

            let assistant_before = change
                .previous
                .as_ref()
                .filter(|p| p.metadata.source == Source::Assistant);
            let (candidate, provenance) = match assistant_before {
                Some(previous) => {
                    (peer_edit_of_assistant(previous, value), Provenance::TrustedAgent)
                }
                None => (value.clone(), Provenance::Untrusted),
            };

            if let Ok(clean) = self.sanitize(&candidate, provenance) {
                if &clean != value {
                    if assistant_before.is_some() && candidate != *value {
                        log::warn!("Reverted peer edit of assistant content on {}", change.id);
                    } else if clean.metadata.source != value.metadata.source {
                        log::warn!(
                            "Rejected assistant provenance on imported object {}",
                            change.id
                        );
                    }
                    fixes.push((change.collection, Some(clean), change.id.clone()));
                }
            }
        }

        if fixes.is_empty() {
            return Ok(Vec::new());
        }
        store.transact(Origin::Local, |tx| {
            for (collection, fix, id) in &fixes {
                match fix {
                    Some(object) => tx.set(*collection, object)?,
                    None => {
                        tx.delete(*collection, id)?;
                    }
                }
            }
            Ok(())
        })
    }
}
