#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use fractree::db::{FileTreeStore, TreeMeta, TreeStore};
use fractree::storage::LeafOptions;
use fractree::types::{FtError, Result};
use fractree::{GcContext, LeafId, Msn, Tree, TreeOptions};
use tempfile::{tempdir, TempDir};

fn open_tree(dir: &Path, options: TreeOptions) -> Result<Tree> {
    let store: Arc<dyn TreeStore> = Arc::new(FileTreeStore::open(dir)?);
    Tree::open(store, options)
}

fn setup() -> Result<(TempDir, Tree)> {
    let dir = tempdir()?;
    let tree = open_tree(dir.path(), TreeOptions::default())?;
    Ok((dir, tree))
}

#[test]
fn issuance_resumes_above_persisted_mark() -> Result<()> {
    let (dir, tree) = setup()?;
    let gc = GcContext::quiescent();
    let mut last = Msn::ZERO;
    for i in 0..10u8 {
        let msg = tree.insert_message(vec![b'k', i], vec![i]);
        assert!(msg.msn() > last);
        last = msg.msn();
        tree.apply_to_root(&msg, &gc)?;
    }
    tree.close()?;

    let tree = open_tree(dir.path(), TreeOptions::default())?;
    assert_eq!(tree.high_water(), last);
    let next = tree.next_msn();
    assert!(next > last);

    let msg = tree.insert_message("after", "reopen");
    assert!(tree.apply_to_root(&msg, &gc)?.applied);
    tree.verify_leaf(tree.root())?;
    Ok(())
}

#[test]
fn unflushed_high_water_is_recovered_from_leaves() -> Result<()> {
    let (dir, tree) = setup()?;
    let gc = GcContext::quiescent();
    let leaf = tree.create_leaf()?;
    tree.apply(leaf, &tree.insert_message("a", "1"), &gc)?;
    tree.checkpoint()?;

    // Meta claims a lower mark than the leaf image, as after a torn write.
    let store = FileTreeStore::open(dir.path())?;
    let mut meta = store.load_meta()?.ok_or(FtError::NotFound)?;
    meta.max_msn_in_tree = Msn::ZERO;
    store.store_meta(&meta)?;
    drop(tree);

    let tree = open_tree(dir.path(), TreeOptions::default())?;
    assert_eq!(tree.lookup(leaf, b"a")?, Some(Bytes::from_static(b"1")));
    assert!(tree.next_msn() > Msn(1));
    Ok(())
}

#[test]
fn close_without_checkpoint_loses_unflushed_writes() -> Result<()> {
    let dir = tempdir()?;
    let options = TreeOptions::default().checkpoint_on_close(false);
    let tree = open_tree(dir.path(), options.clone())?;
    let gc = GcContext::quiescent();
    tree.apply_to_root(&tree.insert_message("kept", "1"), &gc)?;
    tree.checkpoint()?;
    tree.apply_to_root(&tree.insert_message("lost", "2"), &gc)?;
    tree.close()?;

    let tree = open_tree(dir.path(), options)?;
    assert!(tree.lookup(tree.root(), b"kept")?.is_some());
    assert!(tree.lookup(tree.root(), b"lost")?.is_none());
    Ok(())
}

#[test]
fn damaged_leaf_image_is_reported() -> Result<()> {
    let (dir, tree) = setup()?;
    tree.apply_to_root(&tree.insert_message("k", "v"), &GcContext::quiescent())?;
    let root = tree.root();
    tree.close()?;

    let image = fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| path.extension().map_or(false, |ext| ext == "ftl"))
        .ok_or(FtError::NotFound)?;
    let mut bytes = fs::read(&image)?;
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    fs::write(&image, bytes)?;

    let tree = open_tree(dir.path(), TreeOptions::default())?;
    assert!(matches!(tree.pin(root), Err(FtError::Corruption(_))));
    assert!(matches!(tree.pin(LeafId(77)), Err(FtError::NotFound)));
    Ok(())
}

#[test]
fn leaf_options_survive_through_config() -> Result<()> {
    let dir = tempdir()?;
    let options = TreeOptions::default().leaf_options(LeafOptions::default().max_versions(1));
    let tree = open_tree(dir.path(), options)?;
    let gc = GcContext::retain_all();
    tree.apply_to_root(&tree.insert_message("k", "v1"), &gc)?;
    let err = tree
        .apply_to_root(&tree.insert_message("k", "v2"), &gc)
        .unwrap_err();
    assert!(err.is_resource_exhaustion());
    assert_eq!(tree.lookup(tree.root(), b"k")?, Some(Bytes::from_static(b"v1")));
    let meta: TreeMeta = {
        tree.checkpoint()?;
        FileTreeStore::open(dir.path())?
            .load_meta()?
            .ok_or(FtError::NotFound)?
    };
    assert_eq!(meta.max_msn_in_tree, tree.high_water());
    Ok(())
}
