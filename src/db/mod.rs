//! Tree handle: owns the sequence authority, the applier, resident leaves
//! and the store they are checkpointed to.

mod config;
/// Metadata record and leaf image persistence.
pub mod store;

pub use config::{TreeConfig, TreeOptions};
pub use store::{FileTreeStore, MemTreeStore, TreeMeta, TreeStore};

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{LeafCache, PinSnapshot, PinnedLeaf};
use crate::storage::{
    ApplyOutcome, ApplyStats, ApplyStatsSnapshot, GcContext, LeafApplier, LeafStore, Message,
    MessageKind, MsnAuthority, ReadView, Xids,
};
use crate::types::{FtError, LeafId, Msn, Result};

/// What a checkpoint wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Dirty leaves whose images were written.
    pub leaves_written: usize,
    /// High-water mark recorded in the metadata.
    pub max_msn_in_tree: Msn,
}

/// One open tree.
///
/// Leaves are materialized lazily from the store on first pin. Every leaf
/// loaded raises the sequence authority to at least its watermark, so
/// issuance never falls back below anything already applied.
pub struct Tree {
    store: Arc<dyn TreeStore>,
    authority: MsnAuthority,
    applier: LeafApplier,
    cache: LeafCache,
    meta: Mutex<TreeMeta>,
    checkpoint_on_close: bool,
}

impl Tree {
    /// Opens the tree held by `store`, creating an empty one if the store has
    /// never been checkpointed.
    pub fn open(store: Arc<dyn TreeStore>, options: TreeOptions) -> Result<Self> {
        let cache = LeafCache::new();
        let meta = match store.load_meta()? {
            Some(meta) => meta,
            None => {
                let meta = TreeMeta::fresh();
                let mut root = LeafStore::new();
                root.mark_dirty();
                cache.insert(meta.root, root)?;
                meta
            }
        };
        let mut applier = LeafApplier::new(options.comparator)
            .with_options(options.leaf)
            .with_stats(Arc::new(ApplyStats::default()));
        if let Some(update) = options.update_fn {
            applier = applier.with_update_fn(update);
        }
        info!(
            target: "fractree::tree",
            max_msn_in_tree = meta.max_msn_in_tree.get(),
            root = meta.root.0,
            next_leaf_id = meta.next_leaf_id,
            "opened tree"
        );
        Ok(Self {
            store,
            authority: MsnAuthority::open(meta.max_msn_in_tree),
            applier,
            cache,
            meta: Mutex::new(meta),
            checkpoint_on_close: options.checkpoint_on_close,
        })
    }

    /// Issues the next sequence number.
    pub fn next_msn(&self) -> Msn {
        self.authority.next()
    }

    /// Greatest sequence number issued or observed by this tree.
    pub fn high_water(&self) -> Msn {
        self.authority.high_water()
    }

    /// Raises the high-water mark for messages stamped outside this handle,
    /// such as ones replayed from a log.
    pub fn observe_msn(&self, msn: Msn) {
        self.authority.observe(msn);
    }

    /// Leaf that receives unrouted messages.
    pub fn root(&self) -> LeafId {
        self.meta.lock().root
    }

    /// The applier used by [`Tree::apply`].
    pub fn applier(&self) -> &LeafApplier {
        &self.applier
    }

    /// Builds a message of `kind` stamped with a fresh sequence number.
    pub fn message(
        &self,
        kind: MessageKind,
        key: impl Into<Bytes>,
        value: Option<Bytes>,
        xids: Xids,
    ) -> Result<Message> {
        let key = key.into();
        if kind.is_broadcast() && !key.is_empty() {
            return Err(FtError::Invalid("broadcast messages carry no key"));
        }
        Message::new(kind, self.next_msn(), key, value, xids)
    }

    /// Stamped overwrite-insert in the root context.
    pub fn insert_message(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Message {
        Message::insert(self.next_msn(), key, value)
    }

    /// Stamped delete in the root context.
    pub fn delete_message(&self, key: impl Into<Bytes>) -> Message {
        Message::delete_any(self.next_msn(), key)
    }

    /// Stamped commit of `xids` on every key.
    pub fn commit_message(&self, xids: Xids) -> Message {
        Message::commit_broadcast_txn(self.next_msn()).with_xids(xids)
    }

    /// Stamped abort of `xids` on every key.
    pub fn abort_message(&self, xids: Xids) -> Message {
        Message::abort_broadcast_txn(self.next_msn()).with_xids(xids)
    }

    /// Materializes a new, empty leaf.
    pub fn create_leaf(&self) -> Result<LeafId> {
        let id = {
            let mut meta = self.meta.lock();
            let id = LeafId(meta.next_leaf_id);
            meta.next_leaf_id = meta
                .next_leaf_id
                .checked_add(1)
                .ok_or(FtError::Invalid("leaf id space exhausted"))?;
            id
        };
        let mut leaf = LeafStore::new();
        leaf.mark_dirty();
        self.cache.insert(id, leaf)?;
        debug!(target: "fractree::tree", leaf = id.0, "created leaf");
        Ok(id)
    }

    /// Pins a leaf, loading it from the store on a miss.
    pub fn pin(&self, id: LeafId) -> Result<PinnedLeaf> {
        self.cache.pin_or_load(id, || self.load_leaf(id))
    }

    /// Pins a leaf only if it is resident and free.
    pub fn try_pin(&self, id: LeafId) -> Result<Option<PinnedLeaf>> {
        self.cache.try_pin(id)
    }

    /// Applies `msg` to leaf `id` under a pin.
    pub fn apply(&self, id: LeafId, msg: &Message, gc: &GcContext) -> Result<ApplyOutcome> {
        let mut leaf = self.pin(id)?;
        self.applier.apply(msg, gc, &mut leaf)
    }

    /// Applies `msg` to the root leaf.
    pub fn apply_to_root(&self, msg: &Message, gc: &GcContext) -> Result<ApplyOutcome> {
        self.apply(self.root(), msg, gc)
    }

    /// Current value of `key` in leaf `id`.
    pub fn lookup(&self, id: LeafId, key: &[u8]) -> Result<Option<Bytes>> {
        let leaf = self.pin(id)?;
        Ok(leaf
            .get(self.applier.comparator(), key)
            .map(Bytes::copy_from_slice))
    }

    /// Value of `key` in leaf `id` as seen by `view`.
    pub fn lookup_visible(&self, id: LeafId, key: &[u8], view: &ReadView) -> Result<Option<Bytes>> {
        let leaf = self.pin(id)?;
        Ok(leaf
            .get_visible(self.applier.comparator(), key, view)
            .map(Bytes::copy_from_slice))
    }

    /// Writes every dirty leaf and the metadata to the store.
    ///
    /// The metadata goes first and carries a high-water mark covering every
    /// image written after it, so a crash between the two never leaves a leaf
    /// watermark above the persisted mark.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let mut images = Vec::new();
        let mut max_watermark = Msn::ZERO;
        for id in self.cache.leaf_ids() {
            let mut leaf = self.cache.pin(id)?;
            if !leaf.is_dirty() {
                continue;
            }
            max_watermark = max_watermark.max(leaf.max_msn_applied());
            images.push((id, leaf.encode()));
            leaf.clear_dirty();
        }

        self.authority.observe(max_watermark);
        let meta = {
            let mut meta = self.meta.lock();
            meta.max_msn_in_tree = self.authority.high_water();
            *meta
        };
        let written = self
            .store
            .store_meta(&meta)
            .and_then(|()| self.write_images(&images));
        if let Err(err) = written {
            warn!(target: "fractree::tree", error = %err, "checkpoint failed; leaves stay dirty");
            for (id, _) in &images {
                if let Ok(mut leaf) = self.cache.pin(*id) {
                    leaf.mark_dirty();
                }
            }
            return Err(err);
        }

        let stats = CheckpointStats {
            leaves_written: images.len(),
            max_msn_in_tree: meta.max_msn_in_tree,
        };
        debug!(
            target: "fractree::tree",
            leaves = stats.leaves_written,
            max_msn_in_tree = stats.max_msn_in_tree.get(),
            "checkpoint complete"
        );
        Ok(stats)
    }

    /// Checks a leaf's key order, its arena and that its watermark does not
    /// exceed the tree's high-water mark.
    pub fn verify_leaf(&self, id: LeafId) -> Result<()> {
        let leaf = self.pin(id)?;
        leaf.verify(self.applier.comparator())?;
        if leaf.max_msn_applied() > self.authority.high_water() {
            return Err(FtError::Corruption("leaf watermark above tree high-water mark"));
        }
        Ok(())
    }

    /// Applier counters.
    pub fn stats(&self) -> ApplyStatsSnapshot {
        self.applier.stats().snapshot()
    }

    /// Pin counters.
    pub fn pin_stats(&self) -> PinSnapshot {
        self.cache.snapshot()
    }

    /// Checkpoints if configured to, then releases the tree.
    pub fn close(self) -> Result<()> {
        if self.checkpoint_on_close {
            self.checkpoint()?;
        }
        self.applier.stats().emit_tracing();
        info!(
            target: "fractree::tree",
            high_water = self.authority.high_water().get(),
            "closed tree"
        );
        Ok(())
    }

    fn load_leaf(&self, id: LeafId) -> Result<LeafStore> {
        let Some(image) = self.store.read_leaf(id)? else {
            // Allocated but never written back: metadata reached the store
            // ahead of the image.
            if id.0 != 0 && id.0 < self.meta.lock().next_leaf_id {
                debug!(target: "fractree::tree", leaf = id.0, "leaf has no image; starting empty");
                return Ok(LeafStore::new());
            }
            return Err(FtError::NotFound);
        };
        let leaf = LeafStore::decode(&image)?;
        leaf.verify(self.applier.comparator())?;
        self.authority.observe(leaf.max_msn_applied());
        debug!(
            target: "fractree::tree",
            leaf = id.0,
            entries = leaf.len(),
            watermark = leaf.max_msn_applied().get(),
            "loaded leaf"
        );
        Ok(leaf)
    }

    fn write_images(&self, images: &[(LeafId, Vec<u8>)]) -> Result<()> {
        for (id, image) in images {
            self.store.write_leaf(*id, image)?;
        }
        Ok(())
    }
}
