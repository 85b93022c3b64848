//! Patch API for the agent-execution path.
//!
//! A [`Patch`] is applied against the version the caller last saw. A stale
//! version is rejected whole; on a current version every entry that can be
//! applied is, and the rest come back as warnings.

use kurbo::Rect;
use serde::{Deserialize, Serialize};

use crate::actions::ObjectUpdate;
use crate::crdt::{Collection, Origin, SharedDocument, StoreResult, Transaction};
use crate::object::{ObjectId, ObjectRole, Source, WhiteboardObject};
use crate::validate::{ContentValidator, Provenance};

/// Longest content excerpt shown in a summary line.
const SUMMARY_EXCERPT_CHARS: usize = 60;

/// Creates, updates and deletes applied as one commit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub creates: Vec<WhiteboardObject>,
    #[serde(default)]
    pub updates: Vec<ObjectUpdate>,
    #[serde(default)]
    pub deletes: Vec<ObjectId>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchIssue {
    pub level: IssueLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
}

impl PatchIssue {
    fn warning(object_id: &str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            message: message.into(),
            object_id: Some(object_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchResult {
    pub success: bool,
    pub new_version: u64,
    pub issues: Vec<PatchIssue>,
    pub summary: String,
}

fn locate(tx: &Transaction<'_>, id: &str) -> Option<Collection> {
    Collection::ALL.into_iter().find(|c| tx.contains(*c, id))
}

/// Apply `patch` if `last_known_version` is still current.
pub fn apply_patch(
    store: &mut SharedDocument,
    patch: &Patch,
    last_known_version: u64,
    validator: &ContentValidator,
    provenance: Provenance,
    origin: Origin,
) -> StoreResult<PatchResult> {
    let current = store.version();
    if last_known_version != current {
        log::info!(
            "Rejecting stale patch (caller at {}, board at {})",
            last_known_version, current
        );
        return Ok(PatchResult {
            success: false,
            new_version: current,
            issues: vec![PatchIssue {
                level: IssueLevel::Error,
                message: format!(
                    "Stale version {}: board is at version {}",
                    last_known_version, current
                ),
                object_id: None,
            }],
            summary: summarize(store),
        });
    }

    let mut issues = Vec::new();
    store.transact(origin, |tx| {
        for object in &patch.creates {
            let clean = match validator.sanitize(object, provenance) {
                Ok(clean) => clean,
                Err(e) => {
                    issues.push(PatchIssue::warning(&object.id, format!("Rejected: {}", e)));
                    continue;
                }
            };
            if locate(tx, &clean.id).is_some() {
                issues.push(PatchIssue::warning(&clean.id, "Replaced existing object"));
            }
            tx.insert(&clean)?;
        }

        for update in &patch.updates {
            let Some(collection) = locate(tx, &update.id) else {
                issues.push(PatchIssue::warning(&update.id, "Unknown object, update skipped"));
                continue;
            };
            let diff = validator.sanitize_diff(&update.diff, provenance);
            tx.update(collection, &update.id, &diff)?;
        }

        for id in &patch.deletes {
            match locate(tx, id) {
                Some(collection) => {
                    tx.delete(collection, id)?;
                }
                None => issues.push(PatchIssue::warning(id, "Unknown object, delete skipped")),
            }
        }
        Ok(())
    })?;

    for issue in &issues {
        log::warn!("Patch issue: {}", issue.message);
    }
    Ok(PatchResult {
        success: true,
        new_version: store.version(),
        issues,
        summary: summarize(store),
    })
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= SUMMARY_EXCERPT_CHARS {
        text.to_string()
    } else {
        let mut short: String = text.chars().take(SUMMARY_EXCERPT_CHARS).collect();
        short.push('…');
        short
    }
}

/// Plain-text description of the board, one line per durable object.
pub fn summarize(store: &SharedDocument) -> String {
    let objects = store.objects(Collection::Objects);
    let mut out = format!(
        "Board version {}: {} objects, {} ephemeral",
        store.version(),
        objects.len(),
        store.len(Collection::Ephemeral)
    );
    for object in objects.values() {
        let mut tags = vec![object.kind.name(), object.metadata.source.as_str()];
        if let Some(role) = object.role() {
            tags.push(role.as_str());
        }
        out.push_str(&format!("\n- {} [{}", object.id, tags.join(", ")));
        if let Some(group) = &object.metadata.group_id {
            out.push_str(&format!(", group {}", group));
        }
        out.push(']');
        if let Some(content) = object.kind.content() {
            out.push_str(&format!(" \"{}\"", excerpt(content)));
        }
        let g = &object.geometry;
        out.push_str(&format!(" at ({:.0}, {:.0}) {:.0}x{:.0}", g.x, g.y, g.width, g.height));
        if let Some(anchor) = object.anchor_id() {
            out.push_str(&format!(" anchored to {}", anchor));
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialMode {
    #[default]
    Intersects,
    Contains,
}

/// Object lookup for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ObjectQuery {
    /// Every given field must match.
    Metadata {
        #[serde(default)]
        role: Option<ObjectRole>,
        #[serde(default)]
        source: Option<Source>,
        #[serde(default)]
        group_id: Option<String>,
        #[serde(default)]
        kind: Option<String>,
    },
    /// Objects whose last resolved bounds meet the region.
    Spatial {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        #[serde(default)]
        mode: SpatialMode,
    },
}

impl ObjectQuery {
    pub fn matches(&self, object: &WhiteboardObject) -> bool {
        match self {
            ObjectQuery::Metadata { role, source, group_id, kind } => {
                role.is_none_or(|r| object.role() == Some(r))
                    && source.is_none_or(|s| object.metadata.source == s)
                    && group_id
                        .as_deref()
                        .is_none_or(|g| object.metadata.group_id.as_deref() == Some(g))
                    && kind.as_deref().is_none_or(|k| object.kind.name() == k)
            }
            ObjectQuery::Spatial { x, y, width, height, mode } => {
                let region = Rect::new(*x, *y, x + width, y + height);
                let b = object.bounds();
                match mode {
                    SpatialMode::Intersects => {
                        b.x0 <= region.x1
                            && region.x0 <= b.x1
                            && b.y0 <= region.y1
                            && region.y0 <= b.y1
                    }
                    SpatialMode::Contains => {
                        region.x0 <= b.x0
                            && b.x1 <= region.x1
                            && region.y0 <= b.y0
                            && b.y1 <= region.y1
                    }
                }
            }
        }
    }
}

/// Durable objects matching `query`, ordered by id.
pub fn find_objects(store: &SharedDocument, query: &ObjectQuery) -> Vec<WhiteboardObject> {
    store
        .objects(Collection::Objects)
        .into_values()
        .filter(|object| query.matches(object))
        .collect()
}
