use bytes::Bytes;

use crate::storage::mvcc::VersionTag;
use crate::types::{FtError, Result};

/// Index of a version inside a leaf's arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VersionIdx(u32);

impl VersionIdx {
    /// Position inside the arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a version says about its key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Key holds this value.
    Value(Bytes),
    /// Key was deleted.
    Tombstone,
}

impl Payload {
    /// Value bytes, or `None` for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Payload::Value(bytes) => Some(bytes),
            Payload::Tombstone => None,
        }
    }

    /// Returns `true` for tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }
}

/// One value version. `prev` links to the next older retained version.
#[derive(Clone, Debug)]
pub struct Version {
    /// Value or tombstone.
    pub payload: Payload,
    /// Owner and commit state.
    pub tag: VersionTag,
    /// Next older retained version.
    pub prev: Option<VersionIdx>,
}

/// Slab of versions with a free list; chains refer to slots by index.
#[derive(Clone, Debug, Default)]
pub(crate) struct VersionArena {
    slots: Vec<Option<Version>>,
    free: Vec<VersionIdx>,
    live: usize,
}

impl VersionArena {
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    /// Guarantees the next `additional` allocations succeed without growing past `limit`.
    pub(crate) fn reserve(&mut self, additional: usize, limit: Option<usize>) -> Result<()> {
        if let Some(limit) = limit {
            if self.live.saturating_add(additional) > limit {
                return Err(FtError::VersionLimit {
                    live: self.live,
                    limit,
                });
            }
        }
        let grow = additional.saturating_sub(self.free.len());
        self.slots
            .try_reserve(grow)
            .map_err(|_| FtError::OutOfMemory)
    }

    pub(crate) fn alloc(&mut self, version: Version) -> VersionIdx {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx.index()] = Some(version);
            return idx;
        }
        let idx = VersionIdx(
            u32::try_from(self.slots.len()).unwrap_or_else(|_| panic!("version arena overflow")),
        );
        self.slots.push(Some(version));
        idx
    }

    pub(crate) fn release(&mut self, idx: VersionIdx) -> Version {
        let version = self.slots[idx.index()]
            .take()
            .unwrap_or_else(|| panic!("version slot {} released twice", idx.0));
        self.free.push(idx);
        self.live -= 1;
        version
    }

    pub(crate) fn get(&self, idx: VersionIdx) -> &Version {
        self.slots[idx.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("version slot {} read after release", idx.0))
    }

    pub(crate) fn get_mut(&mut self, idx: VersionIdx) -> &mut Version {
        self.slots[idx.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("version slot {} written after release", idx.0))
    }

    pub(crate) fn is_allocated(&self, idx: VersionIdx) -> bool {
        matches!(self.slots.get(idx.index()), Some(Some(_)))
    }
}

/// Iterator over a version chain, newest first.
pub struct Chain<'a> {
    pub(crate) arena: &'a VersionArena,
    pub(crate) next: Option<VersionIdx>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Version;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let version = self.arena.get(idx);
        self.next = version.prev;
        Some(version)
    }
}
