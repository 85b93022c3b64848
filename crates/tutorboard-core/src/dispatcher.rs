//! Action dispatcher.
//!
//! Applies [`ActionBatch`]es to the shared document in one commit, then
//! projects the resulting changes onto a [`BoardRenderer`]. The projection
//! (what the renderer currently shows, and where) is derived state and can be
//! rebuilt from the store at any time.

use std::collections::{BTreeMap, HashMap, HashSet};

use kurbo::{Rect, Size};
use uuid::Uuid;

use crate::actions::{ActionBatch, BatchOrigin, DispatchError, ObjectUpdate, WhiteboardAction};
use crate::coords::{self, dependents_of, to_percent, CoordinateResolver};
use crate::crdt::{Collection, DocChange, Origin, SharedDocument, StoreResult, Transaction};
use crate::object::{ObjectId, ObjectRole, Rgba, Source, WhiteboardObject};
use crate::render::BoardRenderer;
use crate::validate::{ContentValidator, Provenance};

/// Default time a highlight stays on screen.
pub const DEFAULT_HIGHLIGHT_MS: u64 = 3_000;

/// Dispatcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    /// A batch is being applied (or streamed in).
    Processing { batch_id: Uuid, origin: BatchOrigin },
    /// The last batch was applied and rendered.
    Rendered { batch_id: Uuid },
}

/// Outcome of dispatching a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub batch_id: Uuid,
    /// Actions that had at least one effect or target.
    pub applied: usize,
    /// Skipped entries (unknown ids, rejected content).
    pub warnings: Vec<String>,
    /// Effective store changes.
    pub changes: Vec<DocChange>,
}

impl DispatchReport {
    fn empty(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            applied: 0,
            warnings: Vec::new(),
            changes: Vec::new(),
        }
    }

    fn absorb(&mut self, other: DispatchReport) {
        self.applied += other.applied;
        self.warnings.extend(other.warnings);
        self.changes.extend(other.changes);
    }
}

struct PendingHighlight {
    id: ObjectId,
    duration_ms: Option<u64>,
    color: Option<Rgba>,
}

/// The ids a question owns: itself plus assistant decorations that share its
/// group (both ungrouped counts as shared) or anchor to it.
pub fn question_family(
    objects: &BTreeMap<ObjectId, WhiteboardObject>,
    question: &WhiteboardObject,
) -> Vec<ObjectId> {
    let anchored: HashSet<ObjectId> = dependents_of(objects, &question.id).into_iter().collect();
    let mut family = vec![question.id.clone()];
    for object in objects.values() {
        if object.id == question.id || object.metadata.source != Source::Assistant {
            continue;
        }
        if !object.role().is_some_and(ObjectRole::is_question_decoration) {
            continue;
        }
        let same_group = object.metadata.group_id == question.metadata.group_id;
        if same_group || anchored.contains(&object.id) {
            family.push(object.id.clone());
        }
    }
    family
}

/// Applies the actions of one batch inside a store transaction.
struct BatchApplier {
    validator: ContentValidator,
    viewport: Size,
    origin: BatchOrigin,
    replay: bool,
    applied: usize,
    warnings: Vec<String>,
    highlights: Vec<PendingHighlight>,
    /// Objects created by this batch; the question rule never removes them.
    created: HashSet<ObjectId>,
    /// Objects the current action moved or resized.
    moved: Vec<ObjectId>,
}

impl BatchApplier {
    fn warn(&mut self, action: &WhiteboardAction, message: String) {
        log::warn!("{}: {}", action.name(), message);
        self.warnings.push(format!("{}: {}", action.name(), message));
    }

    fn provenance(&self) -> Provenance {
        match self.origin {
            BatchOrigin::Ai => Provenance::TrustedAgent,
            BatchOrigin::User => Provenance::Untrusted,
        }
    }

    fn locate(tx: &Transaction<'_>, id: &str) -> Option<Collection> {
        Collection::ALL.into_iter().find(|c| tx.contains(*c, id))
    }

    /// Refresh the stored absolute bounds of a relative object.
    fn resolve_in(&self, tx: &Transaction<'_>, object: &mut WhiteboardObject) {
        if !object.geometry.is_relative() {
            return;
        }
        let rect = coords::resolve(&object.geometry, self.viewport, |id| {
            tx.get(Collection::Objects, id).map(|anchor| anchor.bounds())
        });
        object.geometry.set_resolved(rect);
    }

    /// Write fresh bounds for everything anchored to `moved`.
    ///
    /// Dependents come back from `dependents_of` after their anchor, so a
    /// chain resolves against bounds already written in this transaction.
    fn settle_dependents(&self, tx: &mut Transaction<'_>, moved: &[ObjectId]) -> StoreResult<()> {
        if moved.is_empty() {
            return Ok(());
        }
        let mut board = tx.objects(Collection::Ephemeral);
        board.extend(tx.objects(Collection::Objects));
        for id in moved {
            for dependent in dependents_of(&board, id) {
                let Some(collection) = Self::locate(tx, &dependent) else {
                    continue;
                };
                let Some(mut object) = tx.get(collection, &dependent) else {
                    continue;
                };
                let before = object.bounds();
                self.resolve_in(tx, &mut object);
                if object.bounds() != before {
                    tx.set(collection, &object)?;
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, tx: &mut Transaction<'_>, action: &WhiteboardAction) -> StoreResult<()> {
        self.apply_action(tx, action)?;
        let moved = std::mem::take(&mut self.moved);
        self.settle_dependents(tx, &moved)
    }

    fn apply_action(
        &mut self,
        tx: &mut Transaction<'_>,
        action: &WhiteboardAction,
    ) -> StoreResult<()> {
        match action {
            WhiteboardAction::AddObjects { objects } => self.add_objects(tx, action, objects),
            WhiteboardAction::UpdateObjects { updates } => self.update_objects(tx, action, updates),
            WhiteboardAction::DeleteObjects { ids } => {
                let mut any = false;
                for id in ids {
                    match Self::locate(tx, id) {
                        Some(collection) => any |= tx.delete(collection, id)?,
                        None => self.warn(action, format!("unknown object {}", id)),
                    }
                }
                if any {
                    self.applied += 1;
                }
                Ok(())
            }
            WhiteboardAction::ClearBoard { role, kind } => {
                let doomed: Vec<ObjectId> = tx
                    .objects(Collection::Objects)
                    .into_values()
                    .filter(|o| role.is_none_or(|r| o.role() == Some(r)))
                    .filter(|o| kind.as_deref().is_none_or(|k| o.kind.name() == k))
                    .map(|o| o.id)
                    .collect();
                for id in &doomed {
                    tx.delete(Collection::Objects, id)?;
                }
                log::debug!("Cleared {} objects", doomed.len());
                self.applied += 1;
                Ok(())
            }
            WhiteboardAction::HighlightObject { id, duration_ms, color } => {
                if Self::locate(tx, id).is_none() {
                    self.warn(action, format!("unknown object {}", id));
                } else if !self.replay {
                    self.highlights.push(PendingHighlight {
                        id: id.clone(),
                        duration_ms: *duration_ms,
                        color: *color,
                    });
                    self.applied += 1;
                }
                Ok(())
            }
            WhiteboardAction::GroupObjects { ids, group_id } => {
                let mut any = false;
                for id in ids {
                    let Some(collection) = Self::locate(tx, id) else {
                        self.warn(action, format!("unknown object {}", id));
                        continue;
                    };
                    if let Some(mut object) = tx.get(collection, id) {
                        object.metadata.group_id = Some(group_id.clone());
                        tx.set(collection, &object)?;
                        any = true;
                    }
                }
                if any {
                    self.applied += 1;
                }
                Ok(())
            }
            WhiteboardAction::MoveGroup { group_id, dx, dy } => {
                self.move_group(tx, action, group_id, *dx, *dy)
            }
            WhiteboardAction::DeleteGroup { group_id } => {
                let members = Self::group_members(tx, group_id);
                if members.is_empty() {
                    self.warn(action, format!("empty group {}", group_id));
                    return Ok(());
                }
                for object in &members {
                    tx.delete(Collection::Objects, &object.id)?;
                }
                self.applied += 1;
                Ok(())
            }
        }
    }

    fn group_members(tx: &Transaction<'_>, group_id: &str) -> Vec<WhiteboardObject> {
        tx.objects(Collection::Objects)
            .into_values()
            .filter(|o| o.metadata.group_id.as_deref() == Some(group_id))
            .collect()
    }

    fn add_objects(
        &mut self,
        tx: &mut Transaction<'_>,
        action: &WhiteboardAction,
        objects: &[WhiteboardObject],
    ) -> StoreResult<()> {
        let mut clean = Vec::with_capacity(objects.len());
        for object in objects {
            match self.validator.sanitize(object, self.provenance()) {
                Ok(mut object) => {
                    if self.origin == BatchOrigin::Ai {
                        object.metadata.source = Source::Assistant;
                    }
                    clean.push(object);
                }
                Err(e) => self.warn(action, format!("rejected object: {}", e)),
            }
        }
        if clean.is_empty() {
            return Ok(());
        }

        // One live question: retire earlier assistant questions first
        if clean.iter().any(WhiteboardObject::is_question) {
            let existing = tx.objects(Collection::Objects);
            let mut retired = HashSet::new();
            for question in existing.values() {
                if !question.is_question() || question.metadata.source != Source::Assistant {
                    continue;
                }
                if self.created.contains(&question.id) {
                    continue;
                }
                for id in question_family(&existing, question) {
                    if !self.created.contains(&id) {
                        retired.insert(id);
                    }
                }
            }
            for id in &retired {
                tx.delete(Collection::Objects, id)?;
            }
            if !retired.is_empty() {
                log::debug!("Retired {} objects of the previous question", retired.len());
            }
        }

        for object in &clean {
            tx.insert(object)?;
            self.created.insert(object.id.clone());
        }
        // Second pass so anchors added in the same action are visible
        for mut object in clean {
            self.resolve_in(tx, &mut object);
            tx.set(Collection::for_object(&object), &object)?;
            self.moved.push(object.id);
        }
        self.applied += 1;
        Ok(())
    }

    fn update_objects(
        &mut self,
        tx: &mut Transaction<'_>,
        action: &WhiteboardAction,
        updates: &[ObjectUpdate],
    ) -> StoreResult<()> {
        let mut any = false;
        for update in updates {
            let Some(collection) = Self::locate(tx, &update.id) else {
                self.warn(action, format!("unknown object {}", update.id));
                continue;
            };
            let Some(mut object) = tx.get(collection, &update.id) else {
                continue;
            };
            let diff = self.validator.sanitize_diff(&update.diff, self.provenance());
            diff.apply_to(&mut object);
            if diff.touches_geometry() {
                self.resolve_in(tx, &mut object);
                self.moved.push(object.id.clone());
            }
            tx.set(collection, &object)?;
            any = true;
        }
        if any {
            self.applied += 1;
        }
        Ok(())
    }

    fn move_group(
        &mut self,
        tx: &mut Transaction<'_>,
        action: &WhiteboardAction,
        group_id: &str,
        dx: f64,
        dy: f64,
    ) -> StoreResult<()> {
        let mut members = Self::group_members(tx, group_id);
        if members.is_empty() {
            self.warn(action, format!("empty group {}", group_id));
            return Ok(());
        }
        let member_ids: HashSet<ObjectId> = members.iter().map(|o| o.id.clone()).collect();
        let dx_pct = to_percent(dx, self.viewport.width);
        let dy_pct = to_percent(dy, self.viewport.height);

        // Free members first so anchored ones resolve against moved anchors
        members.sort_by_key(|o| o.geometry.anchor.is_some());
        for mut object in members {
            let g = &mut object.geometry;
            match &mut g.anchor {
                Some(anchor) if member_ids.contains(&anchor.anchor_id) => {}
                Some(anchor) => {
                    anchor.offset_x_pct += dx_pct;
                    anchor.offset_y_pct += dy_pct;
                }
                None => {
                    match &mut g.x_pct {
                        Some(pct) => *pct += dx_pct,
                        None => g.x += dx,
                    }
                    match &mut g.y_pct {
                        Some(pct) => *pct += dy_pct,
                        None => g.y += dy,
                    }
                }
            }
            if object.geometry.is_relative() {
                self.resolve_in(tx, &mut object);
            }
            tx.set(Collection::Objects, &object)?;
            self.moved.push(object.id);
        }
        self.applied += 1;
        Ok(())
    }
}

struct StreamingBatch {
    batch: ActionBatch,
    report: DispatchReport,
}

/// Applies action batches and keeps the renderer in step with the store.
pub struct ActionDispatcher {
    resolver: CoordinateResolver,
    validator: ContentValidator,
    state: DispatchState,
    /// Bounds last sent to the renderer, by id.
    projection: HashMap<ObjectId, Rect>,
    /// Active highlights and when they expire (unix millis).
    highlights: HashMap<ObjectId, u64>,
    highlight_duration_ms: u64,
    streaming: Option<StreamingBatch>,
}

impl ActionDispatcher {
    pub fn new(viewport: Size) -> Self {
        Self {
            resolver: CoordinateResolver::new(viewport),
            validator: ContentValidator::default(),
            state: DispatchState::Idle,
            projection: HashMap::new(),
            highlights: HashMap::new(),
            highlight_duration_ms: DEFAULT_HIGHLIGHT_MS,
            streaming: None,
        }
    }

    pub fn with_validator(mut self, validator: ContentValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_highlight_duration(mut self, duration_ms: u64) -> Self {
        self.highlight_duration_ms = duration_ms;
        self
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn viewport(&self) -> Size {
        self.resolver.viewport()
    }

    /// True while a streamed batch is open.
    pub fn is_busy(&self) -> bool {
        self.streaming.is_some()
    }

    /// Bounds the renderer currently shows for `id`.
    pub fn projected_bounds(&self, id: &str) -> Option<Rect> {
        self.projection.get(id).copied()
    }

    pub fn projection_len(&self) -> usize {
        self.projection.len()
    }

    pub fn is_highlighted(&self, id: &str) -> bool {
        self.highlights.contains_key(id)
    }

    // --- Batches ---

    /// Apply a whole batch as one commit and render the result.
    pub fn dispatch(
        &mut self,
        store: &mut SharedDocument,
        renderer: &mut dyn BoardRenderer,
        batch: &ActionBatch,
        now: u64,
    ) -> Result<DispatchReport, DispatchError> {
        let origin = match batch.origin {
            BatchOrigin::User => Origin::Local,
            BatchOrigin::Ai => Origin::Agent,
        };
        self.dispatch_with_origin(store, renderer, batch, origin, now)
    }

    /// Apply a batch with an explicit store origin (replay uses [`Origin::Replay`]).
    pub fn dispatch_with_origin(
        &mut self,
        store: &mut SharedDocument,
        renderer: &mut dyn BoardRenderer,
        batch: &ActionBatch,
        origin: Origin,
        now: u64,
    ) -> Result<DispatchReport, DispatchError> {
        if let Some(open) = &self.streaming {
            return Err(DispatchError::BatchInFlight(open.batch.id));
        }
        self.state = DispatchState::Processing {
            batch_id: batch.id,
            origin: batch.origin,
        };
        let result = self.run_actions(
            store,
            renderer,
            batch.id,
            batch.origin,
            &batch.actions,
            origin,
            now,
        );
        self.state = match &result {
            Ok(_) => DispatchState::Rendered { batch_id: batch.id },
            Err(_) => DispatchState::Idle,
        };
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_actions(
        &mut self,
        store: &mut SharedDocument,
        renderer: &mut dyn BoardRenderer,
        batch_id: Uuid,
        batch_origin: BatchOrigin,
        actions: &[WhiteboardAction],
        origin: Origin,
        now: u64,
    ) -> Result<DispatchReport, DispatchError> {
        let mut applier = BatchApplier {
            validator: self.validator,
            viewport: self.resolver.viewport(),
            origin: batch_origin,
            replay: origin == Origin::Replay,
            applied: 0,
            warnings: Vec::new(),
            highlights: Vec::new(),
            created: HashSet::new(),
            moved: Vec::new(),
        };
        let changes = store.transact(origin, |tx| {
            for action in actions {
                applier.apply(tx, action)?;
            }
            Ok(())
        })?;

        self.apply_changes(store, renderer, &changes);
        for highlight in applier.highlights.drain(..) {
            self.highlight(renderer, highlight, now);
        }

        log::debug!(
            "Batch {} applied {}/{} actions, {} changes",
            batch_id,
            applier.applied,
            actions.len(),
            changes.len()
        );
        Ok(DispatchReport {
            batch_id,
            applied: applier.applied,
            warnings: applier.warnings,
            changes,
        })
    }

    // --- Streaming ---

    /// Open a batch whose actions arrive one at a time.
    pub fn begin_batch(&mut self, origin: BatchOrigin) -> Result<Uuid, DispatchError> {
        if let Some(open) = &self.streaming {
            return Err(DispatchError::BatchInFlight(open.batch.id));
        }
        let batch = ActionBatch::new(origin, Vec::new());
        let batch_id = batch.id;
        self.state = DispatchState::Processing { batch_id, origin };
        self.streaming = Some(StreamingBatch {
            batch,
            report: DispatchReport::empty(batch_id),
        });
        log::debug!("Streaming batch {} opened", batch_id);
        Ok(batch_id)
    }

    /// Apply one action of the open batch immediately.
    pub fn push_action(
        &mut self,
        store: &mut SharedDocument,
        renderer: &mut dyn BoardRenderer,
        action: WhiteboardAction,
        now: u64,
    ) -> Result<DispatchReport, DispatchError> {
        let Some(mut open) = self.streaming.take() else {
            return Err(DispatchError::NoBatchInFlight);
        };
        let origin = match open.batch.origin {
            BatchOrigin::User => Origin::Local,
            BatchOrigin::Ai => Origin::Agent,
        };
        let result = self.run_actions(
            store,
            renderer,
            open.batch.id,
            open.batch.origin,
            std::slice::from_ref(&action),
            origin,
            now,
        );
        if let Ok(report) = &result {
            open.report.absorb(report.clone());
        }
        open.batch.actions.push(action);
        self.streaming = Some(open);
        result
    }

    /// Close the open batch, returning it for history recording.
    pub fn end_batch(&mut self) -> Result<(ActionBatch, DispatchReport), DispatchError> {
        let open = self.streaming.take().ok_or(DispatchError::NoBatchInFlight)?;
        self.state = DispatchState::Rendered { batch_id: open.batch.id };
        log::debug!(
            "Streaming batch {} closed with {} actions",
            open.batch.id,
            open.batch.actions.len()
        );
        Ok((open.batch, open.report))
    }

    // --- Projection ---

    fn resolved_board(
        &self,
        store: &SharedDocument) -> (BTreeMap<ObjectId, WhiteboardObject>,
        HashMap<ObjectId, Rect>,
    ) {
        let mut objects = store.objects(Collection::Ephemeral);
        objects.extend(store.objects(Collection::Objects));
        let resolved = self.resolver.resolve_all(&objects);
        (objects, resolved)
    }

    /// Project store changes (local or remote) onto the renderer.
    ///
    /// Changed objects are created, updated or deleted; objects anchored to
    /// them are re-resolved and updated if their bounds moved.
    pub fn apply_changes(
        &mut self,
        store: &SharedDocument,
        renderer: &mut dyn BoardRenderer,
        changes: &[DocChange],
    ) {
        if changes.is_empty() {
            return;
        }
        let (objects, resolved) = self.resolved_board(store);

        let mut changed: Vec<&str> = changes.iter().map(|c| c.id.as_str()).collect();
        changed.sort_unstable();
        changed.dedup();

        for id in &changed {
            match (objects.get(*id), resolved.get(*id)) {
                (Some(object), Some(bounds)) => {
                    if self.projection.insert(object.id.clone(), *bounds).is_some() {
                        renderer.update_object(object, *bounds);
                    } else {
                        renderer.create_object(object, *bounds);
                    }
                }
                _ => {
                    if self.projection.remove(*id).is_some() {
                        renderer.delete_object(id);
                    }
                    if self.highlights.remove(*id).is_some() {
                        renderer.clear_highlight(id);
                    }
                }
            }
        }

        let changed_set: HashSet<&str> = changed.iter().copied().collect();
        let mut seen = HashSet::new();
        for id in &changed {
            for dependent in dependents_of(&objects, id) {
                if changed_set.contains(dependent.as_str()) || !seen.insert(dependent.clone()) {
                    continue;
                }
                self.refresh(&objects, &resolved, renderer, &dependent);
            }
        }
    }

    fn refresh(
        &mut self,
        objects: &BTreeMap<ObjectId, WhiteboardObject>,
        resolved: &HashMap<ObjectId, Rect>,
        renderer: &mut dyn BoardRenderer,
        id: &str,
    ) {
        let (Some(object), Some(bounds)) = (objects.get(id), resolved.get(id)) else {
            return;
        };
        match self.projection.insert(id.to_string(), *bounds) {
            Some(previous) if previous == *bounds => {}
            Some(_) => renderer.update_object(object, *bounds),
            None => renderer.create_object(object, *bounds),
        }
    }

    /// Change the viewport and re-render everything whose bounds moved.
    pub fn set_viewport(
        &mut self,
        store: &SharedDocument,
        renderer: &mut dyn BoardRenderer,
        viewport: Size,
    ) {
        if viewport == self.resolver.viewport() {
            return;
        }
        self.resolver.set_viewport(viewport);
        let (objects, resolved) = self.resolved_board(store);
        for id in objects.keys() {
            self.refresh(&objects, &resolved, renderer, id);
        }
        log::debug!("Viewport set to {}x{}", viewport.width, viewport.height);
    }

    /// Throw away the projection and redraw the whole board from the store.
    pub fn rebuild(&mut self, store: &SharedDocument, renderer: &mut dyn BoardRenderer) {
        renderer.clear();
        self.projection.clear();
        self.highlights.clear();
        let (objects, resolved) = self.resolved_board(store);
        for id in objects.keys() {
            self.refresh(&objects, &resolved, renderer, id);
        }
    }

    fn highlight(
        &mut self,
        renderer: &mut dyn BoardRenderer,
        highlight: PendingHighlight,
        now: u64,
    ) {
        let Some(bounds) = self.projection.get(&highlight.id).copied() else {
            return;
        };
        let duration = highlight.duration_ms.unwrap_or(self.highlight_duration_ms);
        let color = highlight.color.unwrap_or_else(Rgba::highlight);
        renderer.highlight_object(&highlight.id, bounds, color);
        self.highlights.insert(highlight.id, now.saturating_add(duration));
    }

    /// Clear highlights whose time is up. Returns how many were cleared.
    pub fn expire_highlights(&mut self, renderer: &mut dyn BoardRenderer, now: u64) -> usize {
        let expired: Vec<ObjectId> = self
            .highlights
            .iter()
            .filter(|(_, at)| now >= **at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.highlights.remove(id);
            renderer.clear_highlight(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{AnchorPlacement, ObjectDiff, ObjectKind};
    use crate::render::{RecordingRenderer, RenderCommand};

    const VIEWPORT: Size = Size::new(1000.0, 800.0);

    fn setup() -> (SharedDocument, RecordingRenderer, ActionDispatcher) {
        (SharedDocument::new(), RecordingRenderer::new(), ActionDispatcher::new(VIEWPORT))
    }

    fn add(objects: Vec<WhiteboardObject>) -> WhiteboardAction {
        WhiteboardAction::AddObjects { objects }
    }

    fn question(id: &str, group: &str) -> WhiteboardObject {
        WhiteboardObject::text(id, "What is 6 x 7?")
            .with_role(ObjectRole::Question)
            .with_group(group)
            .with_percent(10.0, 10.0, 60.0, 10.0)
    }

    fn option(id: &str, group: &str, anchor: &str) -> WhiteboardObject {
        WhiteboardObject::radio_option(id, "42")
            .with_role(ObjectRole::Option)
            .with_group(group)
            .with_bounds(0.0, 0.0, 200.0, 30.0)
            .with_anchor(AnchorPlacement::below(anchor))
    }

    #[test]
    fn test_add_renders_resolved_bounds() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::user(vec![add(vec![
            WhiteboardObject::rectangle("r").with_percent(10.0, 10.0, 20.0, 5.0),
        ])]);
        let report = dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(dispatcher.state(), DispatchState::Rendered { batch_id: batch.id });
        let expected = Rect::new(100.0, 80.0, 300.0, 120.0);
        assert_eq!(
            renderer.take(),
            vec![RenderCommand::Create { id: "r".into(), bounds: expected }]
        );
        // Stored absolute fields hold the resolved bounds
        assert_eq!(store.get(Collection::Objects, "r").unwrap().bounds(), expected);
    }

    #[test]
    fn test_ai_batch_forces_assistant_source() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let ai = ActionBatch::ai(vec![add(vec![WhiteboardObject::text("a", "hi")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &ai, 0).unwrap();
        assert_eq!(store.get(Collection::Objects, "a").unwrap().metadata.source, Source::Assistant);

        let user = ActionBatch::user(vec![add(vec![
            WhiteboardObject::text("u", "forged").with_source(Source::Assistant),
        ])]);
        dispatcher.dispatch(&mut store, &mut renderer, &user, 0).unwrap();
        assert_eq!(store.get(Collection::Objects, "u").unwrap().metadata.source, Source::User);
    }

    #[test]
    fn test_single_live_question() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let first = ActionBatch::ai(vec![add(vec![
            question("q1", "g1"),
            option("o1", "g1", "q1"),
            option("o2", "g1", "q1"),
        ])]);
        dispatcher.dispatch(&mut store, &mut renderer, &first, 0).unwrap();
        let user_note =
            ActionBatch::user(vec![add(vec![WhiteboardObject::text("note", "my work")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &user_note, 0).unwrap();
        assert_eq!(store.len(Collection::Objects), 4);

        let second =
            ActionBatch::ai(vec![add(vec![question("q2", "g2"), option("p1", "g2", "q2")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &second, 0).unwrap();

        let ids: Vec<ObjectId> = store.objects(Collection::Objects).into_keys().collect();
        assert_eq!(ids, vec!["note".to_string(), "p1".to_string(), "q2".to_string()]);
        let questions = store
            .objects(Collection::Objects)
            .into_values()
            .filter(|o| o.is_question())
            .count();
        assert_eq!(questions, 1);
    }

    #[test]
    fn test_user_question_retires_assistant_question() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let ai = ActionBatch::ai(vec![add(vec![question("q1", "g1"), option("o1", "g1", "q1")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &ai, 0).unwrap();

        let user = ActionBatch::user(vec![add(vec![question("mine", "g2")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &user, 0).unwrap();

        let ids: Vec<ObjectId> = store.objects(Collection::Objects).into_keys().collect();
        assert_eq!(ids, vec!["mine".to_string()]);

        // A user question is never retired by a later one
        let again = ActionBatch::user(vec![add(vec![question("other", "g3")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &again, 0).unwrap();
        assert_eq!(store.len(Collection::Objects), 2);
    }

    #[test]
    fn test_unknown_ids_skip_single_entry() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::user(vec![
            add(vec![WhiteboardObject::rectangle("a").with_bounds(0.0, 0.0, 10.0, 10.0)]),
            WhiteboardAction::UpdateObjects {
                updates: vec![
                    ObjectUpdate {
                        id: "ghost".into(),
                        diff: ObjectDiff { x: Some(5.0), ..Default::default() },
                    },
                    ObjectUpdate {
                        id: "a".into(),
                        diff: ObjectDiff { x: Some(50.0), ..Default::default() },
                    },
                ],
            },
            WhiteboardAction::DeleteObjects { ids: vec!["nobody".into()] },
        ]);
        let report = dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.applied, 2);
        assert_eq!(store.get(Collection::Objects, "a").unwrap().geometry.x, 50.0);
    }

    #[test]
    fn test_anchor_move_reresolves_dependents() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::ai(vec![add(vec![question("q", "g"), option("o", "g", "q")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        assert_eq!(dispatcher.projected_bounds("o").unwrap().y0, 160.0);
        renderer.take();

        let mv = ActionBatch::user(vec![WhiteboardAction::UpdateObjects {
            updates: vec![ObjectUpdate {
                id: "q".into(),
                diff: ObjectDiff { y_pct: Some(50.0), ..Default::default() },
            }],
        }]);
        dispatcher.dispatch(&mut store, &mut renderer, &mv, 0).unwrap();
        let commands = renderer.take();
        assert!(commands.contains(&RenderCommand::Update {
            id: "o".into(),
            bounds: Rect::new(100.0, 480.0, 300.0, 510.0),
        }));
        // The move is written through, not only rendered
        assert_eq!(
            store.get(Collection::Objects, "o").unwrap().bounds(),
            Rect::new(100.0, 480.0, 300.0, 510.0)
        );
    }

    #[test]
    fn test_anchor_moved_then_deleted_keeps_last_position() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::ai(vec![add(vec![question("q", "g"), option("o", "g", "q")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();

        let mv = ActionBatch::user(vec![WhiteboardAction::UpdateObjects {
            updates: vec![ObjectUpdate {
                id: "q".into(),
                diff: ObjectDiff { y_pct: Some(50.0), ..Default::default() },
            }],
        }]);
        dispatcher.dispatch(&mut store, &mut renderer, &mv, 0).unwrap();
        let del =
            ActionBatch::user(vec![WhiteboardAction::DeleteObjects { ids: vec!["q".into()] }]);
        dispatcher.dispatch(&mut store, &mut renderer, &del, 0).unwrap();

        let last = Rect::new(100.0, 480.0, 300.0, 510.0);
        assert_eq!(dispatcher.projected_bounds("o"), Some(last));
        assert_eq!(store.get(Collection::Objects, "o").unwrap().bounds(), last);

        // A fresh projection agrees with the incremental one
        dispatcher.rebuild(&store, &mut renderer);
        assert_eq!(dispatcher.projected_bounds("o"), Some(last));
    }

    #[test]
    fn test_readding_as_ephemeral_moves_the_id() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let durable = WhiteboardObject::rectangle("x").with_bounds(0.0, 0.0, 10.0, 10.0);
        let first = ActionBatch::user(vec![add(vec![durable.clone()])]);
        dispatcher.dispatch(&mut store, &mut renderer, &first, 0).unwrap();

        let again = ActionBatch::user(vec![add(vec![durable.ephemeral(10_000)])]);
        dispatcher.dispatch(&mut store, &mut renderer, &again, 0).unwrap();

        assert!(!store.contains(Collection::Objects, "x"));
        assert!(store.contains(Collection::Ephemeral, "x"));
        assert!(dispatcher.projected_bounds("x").is_some());
    }

    #[test]
    fn test_deleted_anchor_falls_back() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::ai(vec![add(vec![question("q", "g"), option("o", "g", "q")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        let before = dispatcher.projected_bounds("o").unwrap();

        let del =
            ActionBatch::user(vec![WhiteboardAction::DeleteObjects { ids: vec!["q".into()] }]);
        dispatcher.dispatch(&mut store, &mut renderer, &del, 0).unwrap();
        assert_eq!(dispatcher.projected_bounds("o"), Some(before));
        assert_eq!(dispatcher.projected_bounds("q"), None);
    }

    #[test]
    fn test_viewport_change_rerenders_relative_only() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::user(vec![add(vec![
            WhiteboardObject::rectangle("abs").with_bounds(5.0, 5.0, 10.0, 10.0),
            WhiteboardObject::rectangle("pct").with_percent(50.0, 50.0, 10.0, 10.0),
        ])]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        renderer.take();

        dispatcher.set_viewport(&store, &mut renderer, Size::new(2000.0, 800.0));
        assert_eq!(
            renderer.take(),
            vec![RenderCommand::Update {
                id: "pct".into(),
                bounds: Rect::new(1000.0, 400.0, 1200.0, 480.0),
            }]
        );
    }

    #[test]
    fn test_highlight_is_render_only_and_expires() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let add_batch = ActionBatch::user(vec![add(vec![WhiteboardObject::rectangle("r")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &add_batch, 0).unwrap();
        let version = store.version();

        let hl = ActionBatch::ai(vec![WhiteboardAction::HighlightObject {
            id: "r".into(),
            duration_ms: Some(100),
            color: None,
        }]);
        dispatcher.dispatch(&mut store, &mut renderer, &hl, 1_000).unwrap();
        assert_eq!(store.version(), version);
        assert!(dispatcher.is_highlighted("r"));

        assert_eq!(dispatcher.expire_highlights(&mut renderer, 1_099), 0);
        assert_eq!(dispatcher.expire_highlights(&mut renderer, 1_100), 1);
        assert!(!dispatcher.is_highlighted("r"));
    }

    #[test]
    fn test_group_move_and_delete() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::user(vec![
            add(vec![
                WhiteboardObject::rectangle("a").with_bounds(0.0, 0.0, 10.0, 10.0),
                WhiteboardObject::rectangle("b").with_percent(10.0, 10.0, 1.0, 1.0),
                WhiteboardObject::rectangle("c").with_bounds(0.0, 0.0, 10.0, 10.0),
            ]),
            WhiteboardAction::GroupObjects {
                ids: vec!["a".into(), "b".into()],
                group_id: "g".into(),
            },
            WhiteboardAction::MoveGroup { group_id: "g".into(), dx: 100.0, dy: 80.0 },
        ]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        assert_eq!(store.get(Collection::Objects, "a").unwrap().geometry.x, 100.0);
        let b = store.get(Collection::Objects, "b").unwrap();
        assert_eq!(b.geometry.x_pct, Some(20.0));
        assert_eq!(b.geometry.y_pct, Some(20.0));
        assert_eq!(store.get(Collection::Objects, "c").unwrap().geometry.x, 0.0);

        let del = ActionBatch::user(vec![WhiteboardAction::DeleteGroup { group_id: "g".into() }]);
        dispatcher.dispatch(&mut store, &mut renderer, &del, 0).unwrap();
        assert_eq!(store.len(Collection::Objects), 1);
    }

    #[test]
    fn test_clear_board_with_filter() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::ai(vec![
            add(vec![
                question("q", "g"),
                WhiteboardObject::text("h", "try halving").with_role(ObjectRole::Hint),
                WhiteboardObject::rectangle("box"),
            ]),
            WhiteboardAction::ClearBoard { role: Some(ObjectRole::Hint), kind: None },
        ]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        assert!(!store.contains(Collection::Objects, "h"));
        assert_eq!(store.len(Collection::Objects), 2);

        let clear =
            ActionBatch::user(vec![WhiteboardAction::ClearBoard { role: None, kind: None }]);
        dispatcher.dispatch(&mut store, &mut renderer, &clear, 0).unwrap();
        assert_eq!(store.len(Collection::Objects), 0);
        assert_eq!(dispatcher.projection_len(), 0);
    }

    #[test]
    fn test_streaming_batch() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let id = dispatcher.begin_batch(BatchOrigin::Ai).unwrap();
        assert!(dispatcher.is_busy());
        assert!(matches!(
            dispatcher.begin_batch(BatchOrigin::Ai),
            Err(DispatchError::BatchInFlight(_))
        ));

        dispatcher
            .push_action(&mut store, &mut renderer, add(vec![question("q", "g")]), 0)
            .unwrap();
        // Rendered before the batch is closed
        assert!(dispatcher.projected_bounds("q").is_some());
        let blocked = ActionBatch::user(vec![]);
        assert!(dispatcher.dispatch(&mut store, &mut renderer, &blocked, 0).is_err());

        dispatcher
            .push_action(&mut store, &mut renderer, add(vec![option("o", "g", "q")]), 0)
            .unwrap();
        let (batch, report) = dispatcher.end_batch().unwrap();
        assert_eq!(batch.id, id);
        assert_eq!(batch.actions.len(), 2);
        assert_eq!(report.applied, 2);
        assert!(!dispatcher.is_busy());
        assert!(matches!(dispatcher.end_batch(), Err(DispatchError::NoBatchInFlight)));
    }

    #[test]
    fn test_rebuild_matches_incremental_projection() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let batch = ActionBatch::ai(vec![add(vec![question("q", "g"), option("o", "g", "q")])]);
        dispatcher.dispatch(&mut store, &mut renderer, &batch, 0).unwrap();
        let incremental = (dispatcher.projected_bounds("q"), dispatcher.projected_bounds("o"));

        let mut fresh = ActionDispatcher::new(VIEWPORT);
        let mut other = RecordingRenderer::new();
        fresh.rebuild(&store, &mut other);
        assert_eq!((fresh.projected_bounds("q"), fresh.projected_bounds("o")), incremental);
        assert_eq!(other.commands[0], RenderCommand::Clear);
    }

    #[test]
    fn test_remote_changes_render() {
        let (mut store, mut renderer, mut dispatcher) = setup();
        let mut peer = SharedDocument::new();
        peer.set(
            Collection::Ephemeral,
            &WhiteboardObject::new("cur", ObjectKind::Cursor { label: "ana".into() })
                .with_bounds(1.0, 2.0, 0.0, 0.0)
                .ephemeral(10),
            Origin::Local,
        )
        .unwrap();
        let delta = peer.take_local_deltas().remove(0);
        let changes = store.apply_remote_delta(&delta.bytes, Origin::Remote).unwrap();
        dispatcher.apply_changes(&store, &mut renderer, &changes);
        assert_eq!(
            renderer.take(),
            vec![RenderCommand::Create { id: "cur".into(), bounds: Rect::new(1.0, 2.0, 1.0, 2.0) }]
        );
    }
}
