#![allow(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use fractree::storage::{
    BytewiseComparator, LeafApplier, LeafStore, Message, UpdateAction, Xids,
};
use fractree::{GcContext, Msn, TxnId};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone)]
enum Op {
    Insert { key: u8, value: u8, txn: u64 },
    InsertNoOverwrite { key: u8, value: u8 },
    Delete { key: u8, txn: u64 },
    DeleteBoth { key: u8, value: u8 },
    Update { key: u8, extra: u8 },
    Broadcast { extra: u8 },
    Commit { txn: u64 },
    Abort { txn: u64 },
    Optimize,
}

fn arb_op() -> impl Strategy<Value = Op> {
    let key = 0u8..6;
    let txn = 0u64..4;
    prop_oneof![
        4 => (key.clone(), any::<u8>(), txn.clone())
            .prop_map(|(key, value, txn)| Op::Insert { key, value, txn }),
        1 => (key.clone(), any::<u8>()).prop_map(|(key, value)| Op::InsertNoOverwrite { key, value }),
        2 => (key.clone(), txn.clone()).prop_map(|(key, txn)| Op::Delete { key, txn }),
        1 => (key.clone(), any::<u8>()).prop_map(|(key, value)| Op::DeleteBoth { key, value }),
        2 => (key, any::<u8>()).prop_map(|(key, extra)| Op::Update { key, extra }),
        1 => any::<u8>().prop_map(|extra| Op::Broadcast { extra }),
        1 => (1u64..4).prop_map(|txn| Op::Commit { txn }),
        1 => (1u64..4).prop_map(|txn| Op::Abort { txn }),
        1 => Just(Op::Optimize),
    ]
}

fn arb_gc() -> impl Strategy<Value = GcContext> {
    (0u64..6, 0u64..6, any::<bool>())
        .prop_map(|(referenced, live, snapshot)| GcContext::new(TxnId(referenced), TxnId(live), snapshot))
}

fn xids(txn: u64) -> Xids {
    Xids::from_ids([TxnId(txn)])
}

fn to_message(op: &Op, msn: Msn) -> Message {
    match *op {
        Op::Insert { key, value, txn } => Message::insert(msn, vec![key], vec![value]).with_xids(xids(txn)),
        Op::InsertNoOverwrite { key, value } => Message::insert_no_overwrite(msn, vec![key], vec![value]),
        Op::Delete { key, txn } => Message::delete_any(msn, vec![key]).with_xids(xids(txn)),
        Op::DeleteBoth { key, value } => Message::delete_both(msn, vec![key], vec![value]),
        Op::Update { key, extra } => Message::update(msn, vec![key], vec![extra]),
        Op::Broadcast { extra } => Message::update_broadcast(msn, vec![extra]),
        Op::Commit { txn } => Message::commit_broadcast_txn(msn).with_xids(xids(txn)),
        Op::Abort { txn } => Message::abort_broadcast_txn(msn).with_xids(xids(txn)),
        Op::Optimize => Message::optimize(msn),
    }
}

fn applier() -> LeafApplier {
    LeafApplier::new(Arc::new(BytewiseComparator)).with_update_fn(Arc::new(
        |_key: &[u8], old: Option<&[u8]>, extra: &[u8]| {
            if extra[0] % 7 == 0 {
                return UpdateAction::Delete;
            }
            let base = old.map_or(0u8, |v| v[v.len() - 1]);
            UpdateAction::Set(Bytes::from(vec![base.wrapping_add(extra[0])]))
        },
    ))
}

fn live_pairs(leaf: &LeafStore) -> Vec<(Vec<u8>, Vec<u8>)> {
    leaf.iter()
        .filter_map(|(key, value)| value.map(|value| (key.to_vec(), value.to_vec())))
        .collect()
}

proptest! {
    #[test]
    fn watermark_tracks_the_highest_accepted_msn(
        msns in prop::collection::vec(1u64..60, 1..80),
    ) {
        let applier = applier();
        let gc = GcContext::quiescent();
        let mut leaf = LeafStore::new();
        let mut highest = 0u64;
        for (i, msn) in msns.iter().copied().enumerate() {
            let msg = Message::insert(Msn(msn), vec![(i % 5) as u8], vec![i as u8]);
            let outcome = applier.apply(&msg, &gc, &mut leaf).unwrap();
            prop_assert_eq!(outcome.applied, msn > highest);
            highest = highest.max(msn);
            prop_assert_eq!(leaf.max_msn_applied(), Msn(highest));
        }
    }

    #[test]
    fn full_replay_changes_nothing(ops in prop::collection::vec(arb_op(), 1..60)) {
        let applier = applier();
        let gc = GcContext::quiescent();
        let stream: Vec<Message> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| to_message(op, Msn(i as u64 + 1)))
            .collect();
        let mut leaf = LeafStore::new();
        for msg in &stream {
            applier.apply(msg, &gc, &mut leaf).unwrap();
        }
        let before = live_pairs(&leaf);
        let versions = leaf.version_count();
        leaf.clear_dirty();
        for msg in &stream {
            prop_assert!(!applier.apply(msg, &gc, &mut leaf).unwrap().applied);
        }
        prop_assert_eq!(live_pairs(&leaf), before);
        prop_assert_eq!(leaf.version_count(), versions);
        prop_assert!(!leaf.is_dirty());
    }

    #[test]
    fn garbage_collection_never_changes_current_values(
        steps in prop::collection::vec((arb_op(), arb_gc(), any::<bool>()), 1..60),
    ) {
        let applier = applier();
        let mut pruned = LeafStore::new();
        let mut kept = LeafStore::new();
        for (i, (op, gc, prune_after)) in steps.iter().enumerate() {
            let msg = to_message(op, Msn(i as u64 + 1));
            applier.apply(&msg, gc, &mut pruned).unwrap();
            applier.apply(&msg, &GcContext::retain_all(), &mut kept).unwrap();
            if *prune_after {
                pruned.prune(gc);
            }
            prop_assert_eq!(live_pairs(&pruned), live_pairs(&kept));
        }
        pruned.verify(applier.comparator()).unwrap();
        kept.verify(applier.comparator()).unwrap();
    }

    #[test]
    fn delivery_order_does_not_change_the_winner(
        count in 2usize..30,
        seed in any::<u64>(),
    ) {
        let applier = applier();
        let gc = GcContext::quiescent();
        let mut stream: Vec<Message> = (1..=count as u64)
            .map(|msn| Message::insert(Msn(msn), "K", msn.to_be_bytes().to_vec()))
            .collect();
        stream.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let mut leaf = LeafStore::new();
        for msg in &stream {
            applier.apply(msg, &gc, &mut leaf).unwrap();
        }
        let expected = (count as u64).to_be_bytes();
        prop_assert_eq!(leaf.get(applier.comparator(), b"K"), Some(&expected[..]));
        prop_assert_eq!(leaf.max_msn_applied(), Msn(count as u64));
    }
}
