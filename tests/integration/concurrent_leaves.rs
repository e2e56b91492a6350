#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use fractree::db::MemTreeStore;
use fractree::types::Result;
use fractree::{GcContext, LeafId, Msn, Tree, TreeOptions};

const WRITERS: usize = 4;
const PER_WRITER: usize = 250;

fn open() -> Result<Arc<Tree>> {
    Ok(Arc::new(Tree::open(
        Arc::new(MemTreeStore::new()),
        TreeOptions::default(),
    )?))
}

#[test]
fn writers_on_distinct_leaves_never_collide() -> Result<()> {
    let tree = open()?;
    let leaves: Vec<LeafId> = (0..WRITERS)
        .map(|_| tree.create_leaf())
        .collect::<Result<_>>()?;

    let handles: Vec<_> = leaves
        .iter()
        .copied()
        .map(|leaf| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || -> Result<Msn> {
                let gc = GcContext::quiescent();
                let mut last = Msn::ZERO;
                for i in 0..PER_WRITER {
                    let msg = tree.insert_message(format!("key-{i}"), format!("{}", leaf.0));
                    last = msg.msn();
                    assert!(tree.apply(leaf, &msg, &gc)?.applied);
                }
                Ok(last)
            })
        })
        .collect();

    for (leaf, handle) in leaves.iter().zip(handles) {
        let last = handle.join().expect("writer panicked")?;
        let pinned = tree.pin(*leaf)?;
        assert_eq!(pinned.max_msn_applied(), last);
        assert_eq!(pinned.len(), PER_WRITER);
    }
    assert_eq!(tree.high_water(), Msn((WRITERS * PER_WRITER) as u64));
    assert_eq!(tree.pin_stats().pinned, 0);
    Ok(())
}

#[test]
fn racing_writers_on_one_leaf_keep_the_newest() -> Result<()> {
    let tree = open()?;
    let root = tree.root();
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || -> Result<()> {
                let gc = GcContext::quiescent();
                for _ in 0..PER_WRITER {
                    let msg = tree.insert_message("shared", "x");
                    tree.apply(root, &msg, &gc)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    let stats = tree.stats();
    assert_eq!(
        stats.accepted + stats.rejected_stale,
        (WRITERS * PER_WRITER) as u64
    );
    let leaf = tree.pin(root)?;
    assert_eq!(leaf.max_msn_applied(), tree.high_water());
    assert_eq!(leaf.len(), 1);
    Ok(())
}
