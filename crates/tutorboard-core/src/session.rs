//! Client-side board session.
//!
//! A [`BoardSession`] owns everything one open whiteboard needs: the shared
//! document, the dispatcher with its renderer, the history and the reaper.
//! Hosts create one per open board instead of reaching for globals.

use kurbo::Size;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::actions::{parse_actions, ActionBatch, BatchOrigin, DispatchError, WhiteboardAction};
use crate::collaboration::CollaborationManager;
use crate::crdt::{Collection, DocChange, Observer, ObserverId, Origin, SharedDocument, StoreError};
use crate::dispatcher::{ActionDispatcher, DispatchReport, DEFAULT_HIGHLIGHT_MS};
use crate::history::{HistoryError, HistoryManager, HistorySnapshot, ReplayPlan, MAX_USER_SNAPSHOTS};
use crate::object::{ObjectKind, WhiteboardObject};
use crate::reaper::{EphemeralReaper, DEFAULT_SWEEP_INTERVAL_MS};
use crate::render::{BoardRenderer, NullRenderer};
use crate::sync::Connection;
use crate::validate::{ContentValidator, DEFAULT_MAX_ID_LEN, DEFAULT_MAX_TEXT_LEN};

/// Default lifetime of a cursor object without movement.
pub const DEFAULT_CURSOR_TTL_MS: u64 = 5_000;

/// Tunables for a [`BoardSession`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_user_snapshots: usize,
    pub highlight_duration_ms: u64,
    pub max_text_len: usize,
    pub reaper_interval_ms: u64,
    pub cursor_ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_user_snapshots: MAX_USER_SNAPSHOTS,
            highlight_duration_ms: DEFAULT_HIGHLIGHT_MS,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            reaper_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            cursor_ttl_ms: DEFAULT_CURSOR_TTL_MS,
        }
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// One open whiteboard.
pub struct BoardSession<R: BoardRenderer = NullRenderer> {
    store: SharedDocument,
    dispatcher: ActionDispatcher,
    history: HistoryManager,
    reaper: EphemeralReaper,
    validator: ContentValidator,
    renderer: R,
    config: SessionConfig,
}

impl<R: BoardRenderer> BoardSession<R> {
    pub fn new(viewport: Size, renderer: R, config: SessionConfig) -> Self {
        Self::with_document(SharedDocument::new(), viewport, renderer, config)
    }

    /// Open a session over an existing document, e.g. one restored from a snapshot.
    pub fn with_document(
        store: SharedDocument,
        viewport: Size,
        renderer: R,
        config: SessionConfig,
    ) -> Self {
        let validator = ContentValidator::new(DEFAULT_MAX_ID_LEN, config.max_text_len);
        let dispatcher = ActionDispatcher::new(viewport)
            .with_validator(validator)
            .with_highlight_duration(config.highlight_duration_ms);
        let mut session = Self {
            store,
            dispatcher,
            history: HistoryManager::new(config.max_user_snapshots),
            reaper: EphemeralReaper::new(config.reaper_interval_ms),
            validator,
            renderer,
            config,
        };
        if !session.store.is_empty() {
            session.dispatcher.rebuild(&session.store, &mut session.renderer);
        }
        session
    }

    pub fn store(&self) -> &SharedDocument {
        &self.store
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn durable_snapshot(&self) -> HistorySnapshot {
        HistorySnapshot::new(self.store.objects(Collection::Objects))
    }

    /// Record a finished batch. Batches that left the store as it was
    /// (highlights, unknown targets) are not history steps.
    fn record(&mut self, batch: ActionBatch, report: &DispatchReport) {
        if report.changes.is_empty() {
            log::debug!("Batch {} changed nothing, not recorded", batch.id);
            return;
        }
        let snapshot = self.durable_snapshot();
        if batch.origin == BatchOrigin::User {
            self.history.capture(snapshot.clone());
        }
        self.history.record_batch(batch, snapshot);
    }

    // --- Actions ---

    /// Apply a whole batch and record it in history.
    pub fn dispatch(&mut self, batch: ActionBatch, now: u64) -> SessionResult<DispatchReport> {
        let report = self.dispatcher.dispatch(&mut self.store, &mut self.renderer, &batch, now)?;
        for warning in &report.warnings {
            log::warn!("{}", warning);
        }
        self.record(batch, &report);
        Ok(report)
    }

    /// Parse an action stream payload and dispatch it as one batch.
    pub fn dispatch_json(
        &mut self,
        json: &str,
        origin: BatchOrigin,
        now: u64,
    ) -> SessionResult<DispatchReport> {
        let actions = parse_actions(json)?;
        self.dispatch(ActionBatch::new(origin, actions), now)
    }

    /// Open a batch whose actions arrive one at a time. Undo is blocked until it ends.
    pub fn begin_batch(&mut self, origin: BatchOrigin) -> SessionResult<Uuid> {
        let id = self.dispatcher.begin_batch(origin)?;
        self.history.set_batch_in_flight(true);
        Ok(id)
    }

    pub fn push_action(
        &mut self,
        action: WhiteboardAction,
        now: u64,
    ) -> SessionResult<DispatchReport> {
        Ok(self.dispatcher.push_action(&mut self.store, &mut self.renderer, action, now)?)
    }

    /// Close the streamed batch and record it.
    pub fn end_batch(&mut self) -> SessionResult<DispatchReport> {
        let (batch, report) = self.dispatcher.end_batch()?;
        self.history.set_batch_in_flight(false);
        self.record(batch, &report);
        Ok(report)
    }

    // --- History ---

    fn restore(&mut self, snapshot: HistorySnapshot) -> SessionResult<Vec<DocChange>> {
        let changes = self
            .store
            .replace_collection(Collection::Objects, &snapshot.objects, Origin::Replay)?;
        self.dispatcher.apply_changes(&self.store, &mut self.renderer, &changes);
        Ok(changes)
    }

    /// Undo the last local user mutation.
    pub fn undo(&mut self) -> SessionResult<Vec<DocChange>> {
        let snapshot = self.history.undo_user()?;
        self.restore(snapshot)
    }

    pub fn redo(&mut self) -> SessionResult<Vec<DocChange>> {
        let snapshot = self.history.redo_user()?;
        self.restore(snapshot)
    }

    pub fn undo_global(&mut self, now: u64) -> SessionResult<Vec<DocChange>> {
        let plan = self.history.undo_global()?;
        self.replay(plan, now)
    }

    pub fn redo_global(&mut self, now: u64) -> SessionResult<Vec<DocChange>> {
        let plan = self.history.redo_global()?;
        self.replay(plan, now)
    }

    /// Undo the most recent AI turn, keeping later user batches.
    pub fn undo_ai(&mut self, now: u64) -> SessionResult<Vec<DocChange>> {
        let plan = self.history.undo_ai()?;
        self.replay(plan, now)
    }

    pub fn redo_ai(&mut self, now: u64) -> SessionResult<Vec<DocChange>> {
        let plan = self.history.redo_ai()?;
        self.replay(plan, now)
    }

    pub fn replay_to(&mut self, index: usize, now: u64) -> SessionResult<Vec<DocChange>> {
        let plan = self.history.replay_to(index)?;
        self.replay(plan, now)
    }

    /// Rebuild the board from an empty one by replaying the plan.
    ///
    /// The batches run against a scratch document; the live store is then
    /// brought to the result in one commit. A batch that fails is skipped.
    fn replay(&mut self, plan: ReplayPlan, now: u64) -> SessionResult<Vec<DocChange>> {
        let mut scratch = SharedDocument::new();
        let mut scratch_dispatcher =
            ActionDispatcher::new(self.dispatcher.viewport()).with_validator(self.validator);
        let mut sink = NullRenderer;
        for batch in &plan.batches {
            let replayed = scratch_dispatcher.dispatch_with_origin(
                &mut scratch,
                &mut sink,
                batch,
                Origin::Replay,
                now,
            );
            if let Err(e) = replayed {
                log::error!("Replay of batch {} failed: {}", batch.id, e);
            }
        }
        let target = scratch.objects(Collection::Objects);
        let result = self.store.replace_collection(Collection::Objects, &target, Origin::Replay);
        self.history.finish_replay();

        let changes = result?;
        self.dispatcher.apply_changes(&self.store, &mut self.renderer, &changes);
        log::debug!(
            "Replayed {} batches to index {}, {} changes",
            plan.batches.len(),
            plan.target_index,
            changes.len()
        );
        Ok(changes)
    }

    // --- Collaboration ---

    /// Merge a delta that arrived over a host-provided channel.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> SessionResult<Vec<DocChange>> {
        let changes = self.store.apply_remote_delta(bytes, Origin::Remote)?;
        self.dispatcher.apply_changes(&self.store, &mut self.renderer, &changes);
        Ok(changes)
    }

    /// Drive a collaboration channel and render what it brought in.
    pub fn sync<C: Connection>(
        &mut self,
        collaboration: &mut CollaborationManager<C>,
        now: u64,
    ) -> Vec<DocChange> {
        let changes = collaboration.poll(&mut self.store, now);
        self.dispatcher.apply_changes(&self.store, &mut self.renderer, &changes);
        changes
    }

    /// Publish this peer's cursor as an ephemeral object.
    pub fn update_cursor(
        &mut self,
        label: &str,
        x: f64,
        y: f64,
        now: u64,
    ) -> SessionResult<Vec<DocChange>> {
        let id = format!("cursor-{}", self.store.peer_id());
        let cursor = WhiteboardObject::new(id, ObjectKind::Cursor { label: label.to_string() })
            .with_bounds(x, y, 0.0, 0.0)
            .ephemeral(now.saturating_add(self.config.cursor_ttl_ms));
        let changes = self.store.set(Collection::Ephemeral, &cursor, Origin::Local)?;
        self.dispatcher.apply_changes(&self.store, &mut self.renderer, &changes);
        Ok(changes)
    }

    pub fn subscribe(&mut self, observer: Observer) -> ObserverId {
        self.store.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.store.unsubscribe(id)
    }

    // --- Housekeeping ---

    pub fn set_viewport(&mut self, viewport: Size) {
        self.dispatcher.set_viewport(&self.store, &mut self.renderer, viewport);
    }

    /// Reap expired ephemerals and clear finished highlights.
    pub fn tick(&mut self, now: u64) -> Vec<DocChange> {
        let changes = match self.reaper.maybe_sweep(&mut self.store, now) {
            Ok(changes) => changes,
            Err(e) => {
                log::error!("Reaper sweep failed: {}", e);
                Vec::new()
            }
        };
        self.dispatcher.apply_changes(&self.store, &mut self.renderer, &changes);
        self.dispatcher.expire_highlights(&mut self.renderer, now);
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::WhiteboardAction;
    use crate::object::{ObjectRole, Source};
    use crate::render::{RecordingRenderer, RenderCommand};

    const VIEWPORT: Size = Size::new(1000.0, 800.0);

    fn session() -> BoardSession<RecordingRenderer> {
        BoardSession::new(VIEWPORT, RecordingRenderer::new(), SessionConfig::default())
    }

    fn add(objects: Vec<WhiteboardObject>) -> Vec<WhiteboardAction> {
        vec![WhiteboardAction::AddObjects { objects }]
    }

    fn ids(session: &BoardSession<RecordingRenderer>) -> Vec<String> {
        session.store().objects(Collection::Objects).into_keys().collect()
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"cursor_ttl_ms": 900}"#).unwrap();
        assert_eq!(config.cursor_ttl_ms, 900);
        assert_eq!(config.max_user_snapshots, MAX_USER_SNAPSHOTS);
    }

    #[test]
    fn test_user_undo_and_redo_restore_snapshots() {
        let mut s = session();
        s.dispatch(ActionBatch::user(add(vec![WhiteboardObject::rectangle("a")])), 0)
            .unwrap();
        s.dispatch(ActionBatch::user(add(vec![WhiteboardObject::rectangle("b")])), 0)
            .unwrap();
        assert_eq!(ids(&s), vec!["a", "b"]);

        s.undo().unwrap();
        assert_eq!(ids(&s), vec!["a"]);
        s.undo().unwrap();
        assert!(ids(&s).is_empty());
        assert!(matches!(s.undo(), Err(SessionError::History(HistoryError::NothingToUndo))));

        s.redo().unwrap();
        s.redo().unwrap();
        assert_eq!(ids(&s), vec!["a", "b"]);
    }

    #[test]
    fn test_undo_ai_keeps_later_user_batch() {
        let mut s = session();
        let question = WhiteboardObject::text("q", "2 + 2 = ?").with_role(ObjectRole::Question);
        s.dispatch(ActionBatch::ai(add(vec![question])), 0).unwrap();
        s.dispatch(ActionBatch::user(add(vec![WhiteboardObject::text("answer", "4")])), 0)
            .unwrap();

        s.undo_ai(0).unwrap();
        assert_eq!(ids(&s), vec!["answer"]);
        assert!(!s.history().is_replaying());

        s.redo_ai(0).unwrap();
        assert_eq!(ids(&s), vec!["answer", "q"]);
        let q = s.store().get(Collection::Objects, "q").unwrap();
        assert_eq!(q.metadata.source, Source::Assistant);
    }

    #[test]
    fn test_global_undo_redo_is_exact() {
        let mut s = session();
        s.dispatch(
            ActionBatch::ai(add(vec![
                WhiteboardObject::text("t", "hi").with_percent(10.0, 10.0, 20.0, 5.0),
            ])),
            0,
        )
        .unwrap();
        let before = serde_json::to_vec(&s.store().objects(Collection::Objects)).unwrap();
        let delete = vec![WhiteboardAction::DeleteObjects { ids: vec!["t".into()] }];
        s.dispatch(ActionBatch::user(delete), 0).unwrap();

        s.undo_global(0).unwrap();
        let after = serde_json::to_vec(&s.store().objects(Collection::Objects)).unwrap();
        assert_eq!(before, after);

        s.redo_global(0).unwrap();
        assert!(ids(&s).is_empty());
    }

    #[test]
    fn test_undo_rejected_while_batch_streams() {
        let mut s = session();
        s.begin_batch(BatchOrigin::Ai).unwrap();
        s.push_action(
            WhiteboardAction::AddObjects { objects: vec![WhiteboardObject::rectangle("r")] },
            0,
        )
        .unwrap();
        assert!(matches!(s.undo_ai(0), Err(SessionError::History(HistoryError::BatchInFlight))));

        s.end_batch().unwrap();
        assert_eq!(s.history().timeline().len(), 1);
        s.undo_ai(0).unwrap();
        assert!(ids(&s).is_empty());
    }

    #[test]
    fn test_restored_document_is_rendered() {
        let mut source = SharedDocument::new();
        source
            .set(
                Collection::Objects,
                &WhiteboardObject::rectangle("r").with_bounds(1.0, 2.0, 3.0, 4.0),
                Origin::Local,
            )
            .unwrap();
        let doc = SharedDocument::from_snapshot(&source.export_snapshot().unwrap()).unwrap();
        let s = BoardSession::with_document(
            doc,
            VIEWPORT,
            RecordingRenderer::new(),
            SessionConfig::default(),
        );
        assert!(s
            .renderer()
            .commands
            .iter()
            .any(|c| matches!(c, RenderCommand::Create { id, .. } if id == "r")));
    }

    #[test]
    fn test_cursor_expires_on_tick() {
        let mut s = session();
        s.update_cursor("ana", 10.0, 20.0, 1_000).unwrap();
        assert_eq!(s.store().len(Collection::Ephemeral), 1);

        // Still alive right at the deadline
        assert!(s.tick(1_000 + DEFAULT_CURSOR_TTL_MS).is_empty());
        let changes = s.tick(1_000 + DEFAULT_CURSOR_TTL_MS + DEFAULT_SWEEP_INTERVAL_MS);
        assert_eq!(changes.len(), 1);
        assert_eq!(s.store().len(Collection::Ephemeral), 0);
        assert!(s.renderer().commands.iter().any(|c| matches!(c, RenderCommand::Delete { .. })));
    }

    #[test]
    fn test_highlight_cleared_on_tick() {
        let mut s = session();
        s.dispatch(ActionBatch::user(add(vec![WhiteboardObject::rectangle("r")])), 0)
            .unwrap();
        s.dispatch(
            ActionBatch::ai(vec![WhiteboardAction::HighlightObject {
                id: "r".into(),
                duration_ms: Some(100),
                color: None,
            }]),
            0,
        )
        .unwrap();
        assert!(s.dispatcher().is_highlighted("r"));
        s.tick(100);
        assert!(!s.dispatcher().is_highlighted("r"));
    }

    #[test]
    fn test_highlight_is_not_a_history_step() {
        let mut s = session();
        s.dispatch(ActionBatch::user(add(vec![WhiteboardObject::rectangle("r")])), 0)
            .unwrap();
        s.dispatch(
            ActionBatch::ai(vec![WhiteboardAction::HighlightObject {
                id: "r".into(),
                duration_ms: None,
                color: None,
            }]),
            0,
        )
        .unwrap();
        assert_eq!(s.history().timeline().len(), 1);

        // The first global undo takes back the rectangle, not the highlight
        let changes = s.undo_global(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(ids(&s).is_empty());
    }

    #[test]
    fn test_remote_delta_is_rendered_but_not_recorded() {
        let mut peer = SharedDocument::new();
        peer.set(Collection::Objects, &WhiteboardObject::rectangle("p"), Origin::Local)
            .unwrap();
        let delta = peer.take_local_deltas().remove(0);

        let mut s = session();
        s.apply_remote(&delta.bytes).unwrap();
        assert_eq!(ids(&s), vec!["p"]);
        assert_eq!(s.dispatcher().projection_len(), 1);
        assert!(s.history().timeline().is_empty());
        assert!(!s.store().has_local_deltas());
    }
}
