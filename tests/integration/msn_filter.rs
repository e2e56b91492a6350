#![allow(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use fractree::storage::{
    BytewiseComparator, LeafApplier, LeafStore, Message, UpdateAction, Xids,
};
use fractree::{ApplyOutcome, GcContext, Msn, TxnId};

fn applier() -> LeafApplier {
    LeafApplier::new(Arc::new(BytewiseComparator)).with_update_fn(Arc::new(
        |_key: &[u8], old: Option<&[u8]>, extra: &[u8]| {
            let mut value = old.unwrap_or_default().to_vec();
            value.extend_from_slice(extra);
            UpdateAction::Set(Bytes::from(value))
        },
    ))
}

fn value<'a>(applier: &LeafApplier, leaf: &'a LeafStore, key: &[u8]) -> Option<&'a [u8]> {
    leaf.get(applier.comparator(), key)
}

#[test]
fn duplicate_and_stale_inserts_are_filtered() {
    let applier = applier();
    let gc = GcContext::quiescent();
    let mut leaf = LeafStore::new();

    let first = applier
        .apply(&Message::insert(Msn(10), "K", "V1"), &gc, &mut leaf)
        .unwrap();
    assert!(first.applied && first.work_performed);
    assert_eq!(leaf.max_msn_applied(), Msn(10));
    assert_eq!(value(&applier, &leaf, b"K"), Some(&b"V1"[..]));

    let duplicate = applier
        .apply(&Message::insert(Msn(10), "K", "V2"), &gc, &mut leaf)
        .unwrap();
    assert_eq!(duplicate, ApplyOutcome::REJECTED);
    assert_eq!(value(&applier, &leaf, b"K"), Some(&b"V1"[..]));

    let newer = applier
        .apply(&Message::insert(Msn(11), "K", "V3"), &gc, &mut leaf)
        .unwrap();
    assert!(newer.applied);
    assert_eq!(leaf.max_msn_applied(), Msn(11));
    assert_eq!(value(&applier, &leaf, b"K"), Some(&b"V3"[..]));

    let stale = applier
        .apply(&Message::insert(Msn(1), "K", "V4"), &gc, &mut leaf)
        .unwrap();
    assert_eq!(stale, ApplyOutcome::REJECTED);
    assert_eq!(leaf.max_msn_applied(), Msn(11));
    assert_eq!(value(&applier, &leaf, b"K"), Some(&b"V3"[..]));
}

#[test]
fn delivery_order_cannot_resurrect_older_writes() {
    let applier = applier();
    let gc = GcContext::quiescent();
    let older = Message::insert(Msn(5), "K", "A");
    let newer = Message::insert(Msn(7), "K", "B");

    let mut in_order = LeafStore::new();
    applier.apply(&older, &gc, &mut in_order).unwrap();
    applier.apply(&newer, &gc, &mut in_order).unwrap();

    let mut reversed = LeafStore::new();
    applier.apply(&newer, &gc, &mut reversed).unwrap();
    let late = applier.apply(&older, &gc, &mut reversed).unwrap();
    assert!(!late.applied);

    assert_eq!(value(&applier, &in_order, b"K"), Some(&b"B"[..]));
    assert_eq!(value(&applier, &reversed, b"K"), Some(&b"B"[..]));
    assert_eq!(in_order.max_msn_applied(), reversed.max_msn_applied());
}

#[test]
fn filtering_ignores_payload_and_kind() {
    let applier = applier();
    let gc = GcContext::quiescent();
    let mut leaf = LeafStore::new();
    applier
        .apply(&Message::insert(Msn(20), "a", "x"), &gc, &mut leaf)
        .unwrap();

    let stale = [
        Message::insert(Msn(20), "a", "x"),
        Message::insert(Msn(19), "b", "completely different"),
        Message::delete_any(Msn(3), "a"),
        Message::delete_both(Msn(20), "a", "x"),
        Message::update(Msn(2), "a", "suffix"),
        Message::update_broadcast(Msn(20), "suffix"),
        Message::commit_broadcast_all(Msn(15)),
        Message::optimize(Msn(1)),
        Message::noop(Msn(20)),
    ];
    for msg in &stale {
        let outcome = applier.apply(msg, &gc, &mut leaf).unwrap();
        assert_eq!(outcome, ApplyOutcome::REJECTED, "{:?} should be filtered", msg.kind());
    }
    assert_eq!(value(&applier, &leaf, b"a"), Some(&b"x"[..]));
    assert_eq!(value(&applier, &leaf, b"b"), None);
    assert_eq!(applier.stats().rejected_stale(), stale.len() as u64);
}

#[test]
fn accepted_messages_without_work_still_advance() {
    let applier = applier();
    let gc = GcContext::quiescent();
    let mut leaf = LeafStore::new();
    applier
        .apply(&Message::insert(Msn(1), "k", "v"), &gc, &mut leaf)
        .unwrap();

    let quiet = [
        Message::delete_any(Msn(2), "missing"),
        Message::delete_both(Msn(3), "k", "not-the-value"),
        Message::insert_no_overwrite(Msn(4), "k", "ignored"),
        Message::commit_any(Msn(5), "k"),
        Message::noop(Msn(6)),
    ];
    for msg in &quiet {
        leaf.clear_dirty();
        let outcome = applier.apply(msg, &gc, &mut leaf).unwrap();
        assert!(outcome.applied);
        assert!(!outcome.work_performed, "{:?} did work", msg.kind());
        assert_eq!(leaf.max_msn_applied(), msg.msn());
        assert!(leaf.is_dirty());
    }
    assert_eq!(value(&applier, &leaf, b"k"), Some(&b"v"[..]));
}

#[test]
fn replaying_a_prefix_is_idempotent() {
    let applier = applier();
    let gc = GcContext::quiescent();
    let txn = Xids::from_ids([TxnId(3)]);
    let stream = vec![
        Message::insert(Msn(1), "a", "1"),
        Message::insert(Msn(2), "b", "2"),
        Message::update(Msn(3), "a", "+"),
        Message::insert(Msn(4), "c", "3").with_xids(txn.clone()),
        Message::delete_any(Msn(5), "b"),
        Message::commit_broadcast_txn(Msn(6)).with_xids(txn),
        Message::update_broadcast(Msn(7), "!"),
        Message::optimize(Msn(8)),
    ];

    let mut once = LeafStore::new();
    for msg in &stream {
        applier.apply(msg, &gc, &mut once).unwrap();
    }
    let snapshot: Vec<(Vec<u8>, Option<Vec<u8>>)> = once
        .iter()
        .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
        .collect();

    for msg in &stream {
        assert_eq!(applier.apply(msg, &gc, &mut once).unwrap(), ApplyOutcome::REJECTED);
    }
    let replayed: Vec<(Vec<u8>, Option<Vec<u8>>)> = once
        .iter()
        .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
        .collect();
    assert_eq!(snapshot, replayed);
    assert_eq!(value(&applier, &once, b"a"), Some(&b"1+!"[..]));
    assert_eq!(value(&applier, &once, b"c"), Some(&b"3!"[..]));
    assert_eq!(value(&applier, &once, b"b"), None);
}

#[test]
fn leaf_image_keeps_the_watermark() {
    let applier = applier();
    let gc = GcContext::retain_all();
    let mut leaf = LeafStore::new();
    applier
        .apply(&Message::insert(Msn(40), "k", "v1"), &gc, &mut leaf)
        .unwrap();
    applier
        .apply(&Message::insert(Msn(41), "k", "v2"), &gc, &mut leaf)
        .unwrap();

    let mut restored = LeafStore::decode(&leaf.encode()).unwrap();
    assert_eq!(restored.max_msn_applied(), Msn(41));
    assert!(!restored.is_dirty());
    assert_eq!(restored.version_count(), 2);
    let late = applier
        .apply(&Message::insert(Msn(41), "k", "replayed"), &gc, &mut restored)
        .unwrap();
    assert!(!late.applied);
}
