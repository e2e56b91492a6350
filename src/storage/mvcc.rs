use smallvec::SmallVec;

use crate::types::TxnId;

/// Version flags persisted alongside every version in a leaf image.
pub mod flags {
    /// Version records a logical delete (tombstone).
    pub const TOMBSTONE: u8 = 0x01;
    /// Version belongs to a transaction that has not committed yet.
    pub const PROVISIONAL: u8 = 0x02;
}

/// Stack of owning transaction ids, outermost first.
///
/// The empty stack is the root context: writes issued outside any
/// transaction, committed the moment they are applied.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Xids(SmallVec<[TxnId; 4]>);

impl Xids {
    /// Returns the root context.
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    /// Builds a stack from ids ordered outermost to innermost.
    ///
    /// [`TxnId::NONE`] entries are skipped: they name the root, which is implicit.
    pub fn from_ids<I: IntoIterator<Item = TxnId>>(ids: I) -> Self {
        Self(ids.into_iter().filter(|id| !id.is_none()).collect())
    }

    /// Returns the stack for a child transaction nested inside `self`.
    pub fn child(&self, txn: TxnId) -> Self {
        let mut ids = self.0.clone();
        if !txn.is_none() {
            ids.push(txn);
        }
        Self(ids)
    }

    /// Returns the enclosing transaction's stack, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        let mut ids = self.0.clone();
        ids.pop();
        Some(Self(ids))
    }

    /// Returns `true` for the root context.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Outermost transaction, or [`TxnId::NONE`] for the root.
    pub fn outermost(&self) -> TxnId {
        self.0.first().copied().unwrap_or(TxnId::NONE)
    }

    /// Innermost transaction, or [`TxnId::NONE`] for the root.
    pub fn innermost(&self) -> TxnId {
        self.0.last().copied().unwrap_or(TxnId::NONE)
    }

    /// Nesting depth; zero for the root.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when `self` is `ancestor` or nested anywhere inside it.
    pub fn descends_from(&self, ancestor: &Xids) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Ids ordered outermost to innermost.
    pub fn as_slice(&self) -> &[TxnId] {
        &self.0
    }
}

/// Ownership and commit state of one value version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionTag {
    /// Owning transaction stack. Committed versions keep only their committer.
    pub xids: Xids,
    /// Whether the owner has yet to commit.
    pub provisional: bool,
}

impl VersionTag {
    /// Tag for a version written under `xids`; non-root writes start provisional.
    pub fn for_write(xids: &Xids) -> Self {
        Self {
            xids: xids.clone(),
            provisional: !xids.is_root(),
        }
    }

    /// Tag for a committed version whose committer is `txn`.
    pub fn committed(txn: TxnId) -> Self {
        Self {
            xids: Xids::from_ids([txn]),
            provisional: false,
        }
    }

    /// Transaction whose commit made the version visible; [`TxnId::NONE`] for root writes.
    pub fn committer(&self) -> TxnId {
        self.xids.outermost()
    }
}

/// Transaction visibility snapshot used to decide whether a superseded version
/// can still be observed by anyone.
///
/// Only trims space: nothing about message acceptance depends on it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcContext {
    /// Oldest transaction id referenced by any live reader snapshot.
    /// [`TxnId::NONE`] when no snapshot is open.
    pub oldest_referenced_xid: TxnId,
    /// Oldest transaction that may still be running.
    /// [`TxnId::NONE`] when no transaction is live.
    pub oldest_live_xid: TxnId,
    /// Set while a snapshot is being captured; everything is retained.
    pub snapshot_in_progress: bool,
}

impl GcContext {
    /// Builds a context from its three components.
    pub const fn new(
        oldest_referenced_xid: TxnId,
        oldest_live_xid: TxnId,
        snapshot_in_progress: bool,
    ) -> Self {
        Self {
            oldest_referenced_xid,
            oldest_live_xid,
            snapshot_in_progress,
        }
    }

    /// Context with no readers and no live transactions: nothing superseded survives.
    pub const fn quiescent() -> Self {
        Self::new(TxnId::NONE, TxnId::NONE, false)
    }

    /// Context that retains every superseded version.
    pub const fn retain_all() -> Self {
        Self::new(TxnId::NONE, TxnId::NONE, true)
    }

    /// Returns `true` if `txn` may still commit or abort.
    pub fn may_be_live(&self, txn: TxnId) -> bool {
        !txn.is_none() && !self.oldest_live_xid.is_none() && txn >= self.oldest_live_xid
    }

    /// Decides whether `old` must stay reachable now that `new` supersedes it.
    pub fn retains(&self, old: &VersionTag, new: &VersionTag) -> bool {
        if new.provisional {
            // An abort of `new` falls back to `old`, unless the same
            // transaction level wrote both.
            return !(old.provisional && old.xids == new.xids);
        }
        if old.provisional && self.may_be_live(old.xids.outermost()) {
            return true;
        }
        if self.snapshot_in_progress {
            return true;
        }
        if self.oldest_referenced_xid.is_none() {
            return false;
        }
        new.committer() >= self.oldest_referenced_xid
    }
}

/// A reader's view used by [`crate::storage::LeafStore::get_visible`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadView {
    /// Commits by transactions with ids below this are visible.
    pub snapshot_xid: TxnId,
    /// The reader's own transaction stack; its provisional writes are visible to it.
    pub own: Xids,
}

impl ReadView {
    /// Snapshot reader outside any transaction.
    pub fn snapshot(snapshot_xid: TxnId) -> Self {
        Self {
            snapshot_xid,
            own: Xids::root(),
        }
    }

    /// Snapshot reader running inside `own`.
    pub fn in_txn(snapshot_xid: TxnId, own: Xids) -> Self {
        Self { snapshot_xid, own }
    }

    /// Returns `true` if a version with `tag` is visible to this reader.
    pub fn sees(&self, tag: &VersionTag) -> bool {
        if tag.provisional {
            return !self.own.is_root() && self.own.descends_from(&tag.xids);
        }
        let committer = tag.committer();
        committer.is_none() || committer < self.snapshot_xid
    }
}
