//! Replicas converge whatever the delivery order.

use kurbo::Size;
use proptest::prelude::*;
use tutorboard_core::coords::{self, CoordinateResolver};
use tutorboard_core::{Collection, Geometry, ObjectDiff, Origin, SharedDocument, WhiteboardObject};

#[derive(Debug, Clone)]
enum Op {
    Set { id: u8, content: String },
    Move { id: u8, x: i16 },
    Delete { id: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, "[a-z]{0,6}").prop_map(|(id, content)| Op::Set { id, content }),
        (0u8..4, any::<i16>()).prop_map(|(id, x)| Op::Move { id, x }),
        (0u8..4).prop_map(|id| Op::Delete { id }),
    ]
}

fn apply(doc: &mut SharedDocument, op: &Op) {
    // Ops on objects this peer never saw just do nothing
    let _ = match op {
        Op::Set { id, content } => doc.set(
            Collection::Objects,
            &WhiteboardObject::text(format!("o{}", id), content.clone()),
            Origin::Local,
        ),
        Op::Move { id, x } => doc.update(
            Collection::Objects,
            &format!("o{}", id),
            &ObjectDiff { x: Some(f64::from(*x)), ..Default::default() },
            Origin::Local,
        ),
        Op::Delete { id } => doc.delete(Collection::Objects, &format!("o{}", id), Origin::Local),
    };
}

/// Run each peer's ops in isolation and collect every delta produced.
fn produce(ops: &[(u8, Op)]) -> Vec<Vec<u8>> {
    let mut peers: Vec<SharedDocument> = (1..=3)
        .map(|id| SharedDocument::with_peer_id(id).unwrap())
        .collect();
    let mut deltas = Vec::new();
    for (peer, op) in ops {
        let doc = &mut peers[usize::from(*peer)];
        apply(doc, op);
        deltas.extend(doc.take_local_deltas().into_iter().map(|d| d.bytes));
    }
    deltas
}

fn deliver(peer_id: u64, deltas: &[Vec<u8>], order: &[usize]) -> SharedDocument {
    let mut replica = SharedDocument::with_peer_id(peer_id).unwrap();
    for &i in order {
        replica.apply_remote_delta(&deltas[i], Origin::Remote).unwrap();
    }
    replica
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge_under_reordering_and_duplicates(
        ops in prop::collection::vec((0u8..3, op()), 1..16),
        keys in prop::collection::vec(any::<u32>(), 64),
        dups in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let deltas = produce(&ops);
        prop_assume!(!deltas.is_empty());

        let in_order: Vec<usize> = (0..deltas.len()).collect();
        let mut shuffled = in_order.clone();
        shuffled.sort_by_key(|&i| (keys[i % keys.len()], i));
        shuffled.extend(dups.iter().map(|d| d.index(deltas.len())));
        let mut reversed: Vec<usize> = in_order.iter().rev().copied().collect();
        reversed.extend(in_order.iter().copied());

        let a = deliver(10, &deltas, &in_order);
        let b = deliver(11, &deltas, &shuffled);
        let c = deliver(12, &deltas, &reversed);

        prop_assert_eq!(a.board_state(), b.board_state());
        prop_assert_eq!(a.board_state(), c.board_state());
    }

    #[test]
    fn percent_resolution_is_idempotent(
        x_pct in -100.0f64..200.0,
        y_pct in -100.0f64..200.0,
        w_pct in 0.0f64..100.0,
        h_pct in 0.0f64..100.0,
        width in 1.0f64..4000.0,
        height in 1.0f64..4000.0,
    ) {
        let viewport = Size::new(width, height);
        let mut geometry = Geometry::percent(x_pct, y_pct, w_pct, h_pct);

        let first = coords::resolve(&geometry, viewport, |_| None);
        geometry.set_resolved(first);
        let second = coords::resolve(&geometry, viewport, |_| None);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn anchored_board_resolution_is_idempotent(
        anchor_pct in (0.0f64..80.0, 0.0f64..80.0),
        offset in (-10.0f64..10.0, -10.0f64..10.0),
        width in 100.0f64..3000.0,
    ) {
        let viewport = Size::new(width, width * 0.75);
        let resolver = CoordinateResolver::new(viewport);
        let mut board = std::collections::BTreeMap::new();
        board.insert(
            "q".to_string(),
            WhiteboardObject::text("q", "?").with_percent(anchor_pct.0, anchor_pct.1, 20.0, 5.0),
        );
        board.insert(
            "o".to_string(),
            WhiteboardObject::radio_option("o", "4")
                .with_percent(0.0, 0.0, 10.0, 4.0)
                .with_anchor(
                    tutorboard_core::AnchorPlacement::below("q").with_offset(offset.0, offset.1),
                ),
        );

        let first = resolver.resolve_all(&board);
        for (id, rect) in &first {
            if let Some(object) = board.get_mut(id) {
                object.geometry.set_resolved(*rect);
            }
        }
        let second = resolver.resolve_all(&board);
        prop_assert_eq!(first, second);
    }
}
