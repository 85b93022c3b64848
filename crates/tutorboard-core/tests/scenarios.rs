//! End-to-end tutoring scenarios across sessions, peers and the patch API.

use kurbo::Size;
use tutorboard_core::patch::IssueLevel;
use tutorboard_core::{
    apply_patch, ActionBatch, AnchorPlacement, BatchOrigin, BoardSession, Collection,
    ContentValidator,
    EphemeralReaper, HistoryError, ObjectDiff, ObjectRole, ObjectUpdate, Origin, Patch, Provenance,
    RecordingRenderer, SessionConfig, SessionError, SharedDocument, Source, WhiteboardAction,
    WhiteboardObject,
};

const VIEWPORT: Size = Size::new(1200.0, 900.0);

fn session() -> BoardSession<RecordingRenderer> {
    BoardSession::new(VIEWPORT, RecordingRenderer::new(), SessionConfig::default())
}

fn question_batch(n: u32) -> ActionBatch {
    let q = format!("q{}", n);
    let group = format!("g{}", n);
    ActionBatch::ai(vec![WhiteboardAction::AddObjects {
        objects: vec![
            WhiteboardObject::text(q.clone(), format!("Question {}", n))
                .with_percent(10.0, 10.0, 60.0, 8.0)
                .with_role(ObjectRole::Question)
                .with_group(group.clone()),
            WhiteboardObject::radio_option(format!("{}-a", q), "yes")
                .with_percent(0.0, 0.0, 20.0, 5.0)
                .with_anchor(AnchorPlacement::below(q.clone()).with_offset(0.0, 2.0))
                .with_role(ObjectRole::Option)
                .with_group(group.clone()),
            WhiteboardObject::radio_option(format!("{}-b", q), "no")
                .with_percent(0.0, 0.0, 20.0, 5.0)
                .with_anchor(AnchorPlacement::below(format!("{}-a", q)).with_offset(0.0, 1.0))
                .with_role(ObjectRole::Option)
                .with_group(group),
        ],
    }])
}

fn durable_ids(store: &SharedDocument) -> Vec<String> {
    store.objects(Collection::Objects).into_keys().collect()
}

#[test]
fn only_one_question_is_live() {
    let mut s = session();
    s.dispatch(ActionBatch::user(vec![WhiteboardAction::AddObjects {
        objects: vec![WhiteboardObject::text("notes", "my scratch work")],
    }]), 0)
    .unwrap();

    s.dispatch(question_batch(1), 0).unwrap();
    assert_eq!(durable_ids(s.store()), vec!["notes", "q1", "q1-a", "q1-b"]);

    s.dispatch(question_batch(2), 0).unwrap();
    assert_eq!(durable_ids(s.store()), vec!["notes", "q2", "q2-a", "q2-b"]);

    let questions = s
        .store()
        .objects(Collection::Objects)
        .into_values()
        .filter(|o| o.is_question())
        .count();
    assert_eq!(questions, 1);
}

#[test]
fn anchored_options_follow_their_question() {
    let mut s = session();
    s.dispatch(question_batch(1), 0).unwrap();
    let before = s.store().get(Collection::Objects, "q1-b").unwrap().bounds();

    s.dispatch(ActionBatch::ai(vec![WhiteboardAction::UpdateObjects {
        updates: vec![ObjectUpdate {
            id: "q1".into(),
            diff: ObjectDiff { y_pct: Some(30.0), ..Default::default() },
        }],
    }]), 0)
    .unwrap();

    let after = s.dispatcher().projected_bounds("q1-b").unwrap();
    assert!((after.y0 - before.y0 - 0.2 * VIEWPORT.height).abs() < 1e-9);
}

#[test]
fn stale_patch_is_rejected_without_changes() {
    let mut store = SharedDocument::new();
    let validator = ContentValidator::default();
    let first = Patch {
        creates: vec![WhiteboardObject::text("a", "hello")],
        ..Default::default()
    };
    let result = apply_patch(
        &mut store,
        &first,
        0,
        &validator,
        Provenance::TrustedAgent,
        Origin::Agent,
    )
    .unwrap();
    assert!(result.success);
    assert_eq!(result.new_version, 1);

    // Someone else edits in between
    store
        .set(Collection::Objects, &WhiteboardObject::rectangle("b"), Origin::Remote)
        .unwrap();

    let second = Patch {
        deletes: vec!["a".into()],
        ..Default::default()
    };
    let state = store.board_state();
    let result = apply_patch(
        &mut store,
        &second,
        1,
        &validator,
        Provenance::TrustedAgent,
        Origin::Agent,
    )
    .unwrap();
    assert!(!result.success);
    assert_eq!(result.new_version, 2);
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].level, IssueLevel::Error);
    assert_eq!(store.board_state(), state);

    let retry = apply_patch(
        &mut store,
        &second,
        2,
        &validator,
        Provenance::TrustedAgent,
        Origin::Agent,
    )
    .unwrap();
    assert!(retry.success);
    assert_eq!(retry.new_version, 3);
}

#[test]
fn undo_then_redo_restores_identical_bytes() {
    let mut s = session();
    s.dispatch(question_batch(1), 0).unwrap();
    s.dispatch(ActionBatch::user(vec![WhiteboardAction::UpdateObjects {
        updates: vec![ObjectUpdate {
            id: "q1-a".into(),
            diff: ObjectDiff { selected: Some(true), ..Default::default() },
        }],
    }]), 0)
    .unwrap();
    let bytes = serde_json::to_vec(&s.store().objects(Collection::Objects)).unwrap();

    s.undo_global(0).unwrap();
    assert_ne!(serde_json::to_vec(&s.store().objects(Collection::Objects)).unwrap(), bytes);
    s.redo_global(0).unwrap();
    assert_eq!(serde_json::to_vec(&s.store().objects(Collection::Objects)).unwrap(), bytes);
}

#[test]
fn remote_changes_are_never_echoed() {
    let mut tutor = session();
    let mut student = session();

    tutor.dispatch(question_batch(1), 0).unwrap();
    let catch_up = tutor.store().export_since(&student.store().state_vector()).unwrap();
    student.apply_remote(&catch_up).unwrap();
    assert_eq!(durable_ids(student.store()), durable_ids(tutor.store()));
    assert!(!student.store().has_local_deltas());
}

#[test]
fn forged_assistant_source_is_repaired_on_import() {
    let mut server = SharedDocument::with_peer_id(1).unwrap();
    let mut client = SharedDocument::with_peer_id(2).unwrap();
    client
        .set(
            Collection::Objects,
            &WhiteboardObject::text("fake", "trust me").with_source(Source::Assistant),
            Origin::Local,
        )
        .unwrap();
    let forged = client.take_local_deltas().remove(0);

    let changes = server.apply_remote_delta(&forged.bytes, Origin::Remote).unwrap();
    let fixes = ContentValidator::default().repair_import(&mut server, &changes).unwrap();
    assert_eq!(fixes.len(), 1);
    assert_eq!(server.get(Collection::Objects, "fake").unwrap().metadata.source, Source::User);

    // The correction replicates back to the sender
    for delta in server.take_local_deltas() {
        client.apply_remote_delta(&delta.bytes, Origin::Remote).unwrap();
    }
    assert_eq!(client.get(Collection::Objects, "fake").unwrap().metadata.source, Source::User);
}

#[test]
fn refreshed_cursor_survives_a_concurrent_sweep() {
    let mut server = SharedDocument::with_peer_id(1).unwrap();
    let mut client = SharedDocument::with_peer_id(2).unwrap();
    let kind = tutorboard_core::ObjectKind::Cursor { label: "ana".into() };
    let cursor = WhiteboardObject::new("cursor-2", kind).ephemeral(1_000);
    client.set(Collection::Ephemeral, &cursor, Origin::Local).unwrap();
    for delta in client.take_local_deltas() {
        server.apply_remote_delta(&delta.bytes, Origin::Remote).unwrap();
    }

    let reaper = EphemeralReaper::default();
    let candidates = reaper.expired_candidates(&server, 2_000);
    assert_eq!(candidates, vec!["cursor-2".to_string()]);

    // The cursor moves before the delete is committed
    client
        .update(
            Collection::Ephemeral,
            "cursor-2",
            &ObjectDiff { x: Some(40.0), expires_at: Some(6_000), ..Default::default() },
            Origin::Local,
        )
        .unwrap();
    for delta in client.take_local_deltas() {
        server.apply_remote_delta(&delta.bytes, Origin::Remote).unwrap();
    }

    let reaped = reaper.reap(&mut server, &candidates, 2_000).unwrap();
    assert!(reaped.is_empty());
    assert!(server.contains(Collection::Ephemeral, "cursor-2"));

    let reaped = reaper.reap(&mut server, &candidates, 6_001).unwrap();
    assert_eq!(reaped.len(), 1);
    for delta in server.take_local_deltas() {
        client.apply_remote_delta(&delta.bytes, Origin::Remote).unwrap();
    }
    assert!(!client.contains(Collection::Ephemeral, "cursor-2"));
}

fn move_question(id: &str, y_pct: f64) -> ActionBatch {
    ActionBatch::ai(vec![WhiteboardAction::UpdateObjects {
        updates: vec![ObjectUpdate {
            id: id.into(),
            diff: ObjectDiff { y_pct: Some(y_pct), ..Default::default() },
        }],
    }])
}

#[test]
fn options_stay_where_they_were_last_shown_when_the_question_goes() {
    let mut s = session();
    s.dispatch(question_batch(1), 0).unwrap();
    s.dispatch(move_question("q1", 50.0), 0).unwrap();
    let shown = s.dispatcher().projected_bounds("q1-a").unwrap();
    assert_eq!(s.store().get(Collection::Objects, "q1-a").unwrap().bounds(), shown);

    let delete = vec![WhiteboardAction::DeleteObjects { ids: vec!["q1".into()] }];
    s.dispatch(ActionBatch::user(delete), 0).unwrap();
    assert_eq!(s.dispatcher().projected_bounds("q1-a"), Some(shown));
    assert_eq!(s.store().get(Collection::Objects, "q1-a").unwrap().bounds(), shown);

    // A peer that only has the store agrees
    let mut peer = session();
    peer.apply_remote(&s.store().export_snapshot().unwrap()).unwrap();
    assert_eq!(peer.dispatcher().projected_bounds("q1-a"), Some(shown));
}

#[test]
fn highlighting_is_not_an_undo_step() {
    let mut s = session();
    s.dispatch(question_batch(1), 0).unwrap();
    s.dispatch(ActionBatch::ai(vec![WhiteboardAction::HighlightObject {
        id: "q1".into(),
        duration_ms: Some(500),
        color: None,
    }]), 0)
    .unwrap();
    assert!(s.dispatcher().is_highlighted("q1"));
    assert_eq!(s.history().timeline().len(), 1);

    s.undo_ai(0).unwrap();
    assert!(durable_ids(s.store()).is_empty());
}

#[test]
fn an_id_lives_in_one_collection() {
    let mut s = session();
    let marker = WhiteboardObject::rectangle("marker").with_bounds(10.0, 10.0, 20.0, 20.0);
    let add = vec![WhiteboardAction::AddObjects { objects: vec![marker.clone()] }];
    s.dispatch(ActionBatch::user(add), 0).unwrap();
    s.dispatch(ActionBatch::user(vec![WhiteboardAction::AddObjects {
        objects: vec![marker.ephemeral(60_000)],
    }]), 0)
    .unwrap();

    let state = s.store().board_state();
    assert!(!state.objects.contains_key("marker"));
    assert!(state.ephemeral.contains_key("marker"));
}

#[test]
fn undo_waits_for_a_streaming_ai_turn() {
    let mut s = session();
    s.dispatch(ActionBatch::user(vec![WhiteboardAction::AddObjects {
        objects: vec![WhiteboardObject::text("notes", "working")],
    }]), 0)
    .unwrap();

    s.begin_batch(BatchOrigin::Ai).unwrap();
    s.push_action(question_batch(1).actions.remove(0), 0).unwrap();
    assert!(matches!(s.undo(), Err(SessionError::History(HistoryError::BatchInFlight))));
    assert!(matches!(s.undo_global(0), Err(SessionError::History(HistoryError::BatchInFlight))));
    assert!(durable_ids(s.store()).contains(&"q1".to_string()));

    s.end_batch().unwrap();
    s.undo_ai(0).unwrap();
    assert_eq!(durable_ids(s.store()), vec!["notes"]);
}
