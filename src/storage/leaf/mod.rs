//! Leaf store: key-ordered entries, their version chains and the MSN watermark.

mod arena;
mod codec;

pub use arena::{Chain, Payload, Version, VersionIdx};

use std::cmp::Ordering;
use std::collections::HashSet;

use bytes::Bytes;
use tracing::debug;

use crate::storage::comparator::KeyComparator;
use crate::storage::mvcc::{GcContext, ReadView, VersionTag, Xids};
use crate::types::{FtError, Msn, Result};
use arena::VersionArena;

#[derive(Clone, Debug)]
struct LeafEntry {
    key: Bytes,
    head: VersionIdx,
}

/// Space reclaimed by a prune pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PruneStats {
    /// Versions returned to the arena.
    pub versions_reclaimed: usize,
    /// Entries dropped because only a committed tombstone remained.
    pub entries_removed: usize,
}

impl PruneStats {
    fn absorb(&mut self, other: PruneStats) {
        self.versions_reclaimed += other.versions_reclaimed;
        self.entries_removed += other.entries_removed;
    }
}

/// Contents of one leaf partition.
///
/// Mutated only through [`crate::storage::LeafApplier::apply`] by a caller
/// holding exclusive access; `max_msn_applied` never moves backwards.
#[derive(Clone, Debug, Default)]
pub struct LeafStore {
    entries: Vec<LeafEntry>,
    arena: VersionArena,
    max_msn_applied: Msn,
    dirty: bool,
}

impl LeafStore {
    /// Creates an empty, clean leaf with a zero watermark.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the most recently accepted message.
    pub fn max_msn_applied(&self) -> Msn {
        self.max_msn_applied
    }

    /// Whether the leaf changed since it was last written back.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flags the leaf for write-back.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clears the write-back flag once the leaf image is persisted.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Number of keys, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the leaf holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Versions held across all chains.
    pub fn version_count(&self) -> usize {
        self.arena.live()
    }

    /// Current value of `key`: the newest version, provisional or not.
    pub fn get(&self, cmp: &dyn KeyComparator, key: &[u8]) -> Option<&[u8]> {
        let pos = self.find(cmp, key).ok()?;
        self.current_value(pos)
    }

    /// Newest value of `key` that `view` is allowed to observe.
    pub fn get_visible(&self, cmp: &dyn KeyComparator, key: &[u8], view: &ReadView) -> Option<&[u8]> {
        self.history(cmp, key)
            .find(|version| view.sees(&version.tag))
            .and_then(|version| version.payload.value())
    }

    /// Version chain of `key`, newest first. Empty when the key is absent.
    pub fn history(&self, cmp: &dyn KeyComparator, key: &[u8]) -> Chain<'_> {
        let next = self.find(cmp, key).ok().map(|pos| self.entries[pos].head);
        Chain {
            arena: &self.arena,
            next,
        }
    }

    /// Keys in comparator order with their current values (`None` when tombstoned).
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> + '_ {
        self.entries.iter().map(move |entry| {
            (
                &entry.key[..],
                self.arena.get(entry.head).payload.value(),
            )
        })
    }

    /// Drops every retained version no reader described by `gc` can observe.
    ///
    /// Never changes a key's current value; safe to skip entirely.
    pub fn prune(&mut self, gc: &GcContext) -> PruneStats {
        let mut stats = PruneStats::default();
        let mut pos = 0;
        while pos < self.entries.len() {
            let entry = self.prune_entry(pos, gc);
            if entry.entries_removed == 0 {
                pos += 1;
            }
            stats.absorb(entry);
        }
        if stats.versions_reclaimed > 0 {
            self.dirty = true;
            debug!(
                target: "fractree::leaf",
                reclaimed = stats.versions_reclaimed,
                removed = stats.entries_removed,
                live = self.arena.live(),
                "pruned leaf"
            );
        }
        stats
    }

    /// Checks key order under `cmp` and that every allocated version hangs off
    /// exactly one entry.
    pub fn verify(&self, cmp: &dyn KeyComparator) -> Result<()> {
        if self
            .entries
            .windows(2)
            .any(|pair| cmp.compare(&pair[0].key, &pair[1].key) != Ordering::Less)
        {
            return Err(FtError::Corruption("leaf keys out of order"));
        }
        let mut seen = HashSet::with_capacity(self.arena.live());
        for entry in &self.entries {
            let mut next = Some(entry.head);
            while let Some(idx) = next {
                if !self.arena.is_allocated(idx) {
                    return Err(FtError::Corruption("version chain points at a free slot"));
                }
                if !seen.insert(idx) {
                    return Err(FtError::Corruption("version chain shared or cyclic"));
                }
                next = self.arena.get(idx).prev;
            }
        }
        if seen.len() != self.arena.live() {
            return Err(FtError::Corruption("unreachable versions in leaf arena"));
        }
        Ok(())
    }

    pub(crate) fn find(&self, cmp: &dyn KeyComparator, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| cmp.compare(&entry.key, key))
    }

    pub(crate) fn advance_watermark(&mut self, msn: Msn) {
        debug_assert!(msn > self.max_msn_applied, "watermark must advance");
        self.max_msn_applied = msn;
    }

    /// Makes room for `versions` new versions and `entries` new keys, or fails
    /// without side effects.
    pub(crate) fn reserve(&mut self, versions: usize, entries: usize, limit: Option<usize>) -> Result<()> {
        self.arena.reserve(versions, limit)?;
        self.entries
            .try_reserve(entries)
            .map_err(|_| FtError::OutOfMemory)
    }

    pub(crate) fn key_at(&self, pos: usize) -> &Bytes {
        &self.entries[pos].key
    }

    pub(crate) fn head_at(&self, pos: usize) -> &Version {
        self.arena.get(self.entries[pos].head)
    }

    pub(crate) fn current_value(&self, pos: usize) -> Option<&[u8]> {
        self.head_at(pos).payload.value()
    }

    pub(crate) fn insert_entry(
        &mut self,
        cmp: &dyn KeyComparator,
        pos: usize,
        key: Bytes,
        payload: Payload,
        tag: VersionTag,
    ) {
        self.check_neighbours(cmp, pos, &key);
        let head = self.arena.alloc(Version {
            payload,
            tag,
            prev: None,
        });
        self.entries.insert(pos, LeafEntry { key, head });
    }

    /// Whether superseding the entry at `pos` with a version tagged `tag` keeps the old head.
    pub(crate) fn would_retain(&self, pos: usize, tag: &VersionTag, gc: &GcContext) -> bool {
        gc.retains(&self.head_at(pos).tag, tag)
    }

    /// Installs a new head for the entry at `pos`. Returns whether the old head was retained.
    pub(crate) fn supersede(
        &mut self,
        pos: usize,
        payload: Payload,
        tag: VersionTag,
        gc: &GcContext,
    ) -> bool {
        let old_head = self.entries[pos].head;
        let retain = gc.retains(&self.arena.get(old_head).tag, &tag);
        let prev = if retain {
            Some(old_head)
        } else {
            self.arena.release(old_head).prev
        };
        let head = self.arena.alloc(Version { payload, tag, prev });
        self.entries[pos].head = head;
        retain
    }

    /// Removes the entry when all that is left is a committed tombstone.
    pub(crate) fn drop_if_dead(&mut self, pos: usize) -> bool {
        let head = self.head_at(pos);
        if !head.payload.is_tombstone() || head.tag.provisional || head.prev.is_some() {
            return false;
        }
        let entry = self.entries.remove(pos);
        self.arena.release(entry.head);
        true
    }

    /// Commits provisional versions owned by exactly `owner`, or every provisional
    /// version when `owner` is `None`. Returns `(changed, entry_removed)`.
    pub(crate) fn commit_in_entry(
        &mut self,
        pos: usize,
        owner: Option<&Xids>,
        gc: &GcContext,
    ) -> (bool, bool) {
        let mut changed = false;
        let mut next = Some(self.entries[pos].head);
        while let Some(idx) = next {
            let version = self.arena.get_mut(idx);
            next = version.prev;
            if !version.tag.provisional {
                continue;
            }
            let promoted = match owner {
                Some(owner) if &version.tag.xids != owner => continue,
                Some(owner) => match owner.parent() {
                    Some(parent) if !parent.is_root() => VersionTag {
                        xids: parent,
                        provisional: true,
                    },
                    _ => VersionTag::committed(owner.outermost()),
                },
                None => VersionTag::committed(version.tag.xids.outermost()),
            };
            version.tag = promoted;
            changed = true;
        }
        if !changed {
            return (false, false);
        }
        let collapsed = self.prune_entry(pos, gc);
        (true, collapsed.entries_removed > 0)
    }

    /// Unlinks provisional versions owned by `owner` or its children.
    /// Returns `(changed, entry_removed)`.
    pub(crate) fn abort_in_entry(&mut self, pos: usize, owner: &Xids) -> (bool, bool) {
        if owner.is_root() {
            return (false, false);
        }
        let mut changed = false;
        let mut new_head = None;
        let mut last_kept: Option<VersionIdx> = None;
        let mut next = Some(self.entries[pos].head);
        while let Some(idx) = next {
            let version = self.arena.get(idx);
            next = version.prev;
            if version.tag.provisional && version.tag.xids.descends_from(owner) {
                self.arena.release(idx);
                if let Some(kept) = last_kept {
                    self.arena.get_mut(kept).prev = next;
                }
                changed = true;
            } else {
                new_head.get_or_insert(idx);
                last_kept = Some(idx);
            }
        }
        match new_head {
            None => {
                self.entries.remove(pos);
                (changed, true)
            }
            Some(head) => {
                self.entries[pos].head = head;
                (changed, self.drop_if_dead(pos))
            }
        }
    }

    pub(crate) fn prune_entry(&mut self, pos: usize, gc: &GcContext) -> PruneStats {
        let mut stats = PruneStats::default();
        let mut newer = self.entries[pos].head;
        while let Some(older) = self.arena.get(newer).prev {
            if gc.retains(&self.arena.get(older).tag, &self.arena.get(newer).tag) {
                newer = older;
                continue;
            }
            let released = self.arena.release(older);
            self.arena.get_mut(newer).prev = released.prev;
            stats.versions_reclaimed += 1;
        }
        if self.drop_if_dead(pos) {
            stats.versions_reclaimed += 1;
            stats.entries_removed = 1;
        }
        stats
    }

    fn check_neighbours(&self, cmp: &dyn KeyComparator, pos: usize, key: &[u8]) {
        let below = pos
            .checked_sub(1)
            .map(|prev| cmp.compare(&self.entries[prev].key, key));
        let above = self
            .entries
            .get(pos)
            .map(|next| cmp.compare(key, &next.key));
        if below.map_or(true, |ord| ord == Ordering::Less)
            && above.map_or(true, |ord| ord == Ordering::Less)
        {
            return;
        }
        tracing::error!(
            target: "fractree::leaf",
            pos,
            entries = self.entries.len(),
            "comparator returned an inconsistent order"
        );
        panic!("key comparator is not a total order");
    }
}
