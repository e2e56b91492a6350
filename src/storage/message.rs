//! Write messages delivered to leaves.

use std::convert::TryFrom;

use bytes::Bytes;

use crate::storage::mvcc::Xids;
use crate::types::{FtError, Msn, Result};

/// Operation carried by a [`Message`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    /// Install a value, replacing any current one.
    Insert = 1,
    /// Same as [`MessageKind::Insert`]; kept distinct for callers that track it.
    InsertOverwrite = 2,
    /// Install a value only when the key has no live value.
    InsertNoOverwrite = 3,
    /// Tombstone the key.
    DeleteAny = 4,
    /// Tombstone the key only if its current value equals the message value.
    DeleteBoth = 5,
    /// Run the tree's update function against one key.
    Update = 6,
    /// Run the tree's update function against every live key.
    UpdateBroadcast = 7,
    /// Commit the sender's provisional versions of one key.
    CommitAny = 8,
    /// Abort the sender's provisional versions of one key.
    AbortAny = 9,
    /// Commit every provisional version in the leaf.
    CommitBroadcastAll = 10,
    /// Commit the sender's provisional versions of every key.
    CommitBroadcastTxn = 11,
    /// Abort the sender's provisional versions of every key.
    AbortBroadcastTxn = 12,
    /// Reclaim unreachable versions across the leaf.
    Optimize = 13,
    /// Carries only a sequence number.
    None = 14,
}

impl MessageKind {
    /// Stable one-byte code.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the kind addresses every key rather than `message.key()`.
    pub const fn is_broadcast(self) -> bool {
        matches!(
            self,
            MessageKind::UpdateBroadcast
                | MessageKind::CommitBroadcastAll
                | MessageKind::CommitBroadcastTxn
                | MessageKind::AbortBroadcastTxn
                | MessageKind::Optimize
                | MessageKind::None
        )
    }

    /// Whether the kind requires a value (or update extra) payload.
    pub const fn requires_value(self) -> bool {
        matches!(
            self,
            MessageKind::Insert
                | MessageKind::InsertOverwrite
                | MessageKind::InsertNoOverwrite
                | MessageKind::DeleteBoth
                | MessageKind::Update
                | MessageKind::UpdateBroadcast
        )
    }

    /// Lower-case name used by tools.
    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::Insert => "insert",
            MessageKind::InsertOverwrite => "insert_overwrite",
            MessageKind::InsertNoOverwrite => "insert_no_overwrite",
            MessageKind::DeleteAny => "delete_any",
            MessageKind::DeleteBoth => "delete_both",
            MessageKind::Update => "update",
            MessageKind::UpdateBroadcast => "update_broadcast",
            MessageKind::CommitAny => "commit_any",
            MessageKind::AbortAny => "abort_any",
            MessageKind::CommitBroadcastAll => "commit_broadcast_all",
            MessageKind::CommitBroadcastTxn => "commit_broadcast_txn",
            MessageKind::AbortBroadcastTxn => "abort_broadcast_txn",
            MessageKind::Optimize => "optimize",
            MessageKind::None => "none",
        }
    }

    /// Parses a name produced by [`MessageKind::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|kind| kind.name() == name)
    }
}

const ALL_KINDS: [MessageKind; 14] = [
    MessageKind::Insert,
    MessageKind::InsertOverwrite,
    MessageKind::InsertNoOverwrite,
    MessageKind::DeleteAny,
    MessageKind::DeleteBoth,
    MessageKind::Update,
    MessageKind::UpdateBroadcast,
    MessageKind::CommitAny,
    MessageKind::AbortAny,
    MessageKind::CommitBroadcastAll,
    MessageKind::CommitBroadcastTxn,
    MessageKind::AbortBroadcastTxn,
    MessageKind::Optimize,
    MessageKind::None,
];

impl TryFrom<u8> for MessageKind {
    type Error = FtError;

    fn try_from(value: u8) -> Result<Self> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|kind| kind.as_u8() == value)
            .ok_or(FtError::Corruption("unknown message kind"))
    }
}

/// One write intent, stamped with the sequence number it was issued under.
///
/// Immutable once built. The applier borrows it for one call and keeps nothing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    kind: MessageKind,
    key: Bytes,
    value: Option<Bytes>,
    msn: Msn,
    xids: Xids,
}

impl Message {
    /// Builds a message of any kind, checking that the payload matches it.
    pub fn new(
        kind: MessageKind,
        msn: Msn,
        key: impl Into<Bytes>,
        value: Option<Bytes>,
        xids: Xids,
    ) -> Result<Self> {
        if kind.requires_value() && value.is_none() {
            return Err(FtError::Invalid("message kind requires a value"));
        }
        if !kind.requires_value() && value.is_some() {
            return Err(FtError::Invalid("message kind takes no value"));
        }
        Ok(Self {
            kind,
            key: key.into(),
            value,
            msn,
            xids,
        })
    }

    fn keyed(kind: MessageKind, msn: Msn, key: Bytes, value: Option<Bytes>) -> Self {
        Self {
            kind,
            key,
            value,
            msn,
            xids: Xids::root(),
        }
    }

    /// Insert `value` under `key`, overwriting.
    pub fn insert(msn: Msn, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::keyed(MessageKind::Insert, msn, key.into(), Some(value.into()))
    }

    /// Insert `value` under `key` unless a live value exists.
    pub fn insert_no_overwrite(msn: Msn, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::keyed(
            MessageKind::InsertNoOverwrite,
            msn,
            key.into(),
            Some(value.into()),
        )
    }

    /// Delete `key` whatever its value.
    pub fn delete_any(msn: Msn, key: impl Into<Bytes>) -> Self {
        Self::keyed(MessageKind::DeleteAny, msn, key.into(), None)
    }

    /// Delete `key` only while it holds `value`.
    pub fn delete_both(msn: Msn, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::keyed(MessageKind::DeleteBoth, msn, key.into(), Some(value.into()))
    }

    /// Apply the update function to `key` with `extra`.
    pub fn update(msn: Msn, key: impl Into<Bytes>, extra: impl Into<Bytes>) -> Self {
        Self::keyed(MessageKind::Update, msn, key.into(), Some(extra.into()))
    }

    /// Apply the update function to every live key with `extra`.
    pub fn update_broadcast(msn: Msn, extra: impl Into<Bytes>) -> Self {
        Self::keyed(
            MessageKind::UpdateBroadcast,
            msn,
            Bytes::new(),
            Some(extra.into()),
        )
    }

    /// Commit the sender's provisional versions of `key`.
    pub fn commit_any(msn: Msn, key: impl Into<Bytes>) -> Self {
        Self::keyed(MessageKind::CommitAny, msn, key.into(), None)
    }

    /// Abort the sender's provisional versions of `key`.
    pub fn abort_any(msn: Msn, key: impl Into<Bytes>) -> Self {
        Self::keyed(MessageKind::AbortAny, msn, key.into(), None)
    }

    /// Commit every provisional version in the leaf.
    pub fn commit_broadcast_all(msn: Msn) -> Self {
        Self::keyed(MessageKind::CommitBroadcastAll, msn, Bytes::new(), None)
    }

    /// Commit the sender's provisional versions of every key.
    pub fn commit_broadcast_txn(msn: Msn) -> Self {
        Self::keyed(MessageKind::CommitBroadcastTxn, msn, Bytes::new(), None)
    }

    /// Abort the sender's provisional versions of every key.
    pub fn abort_broadcast_txn(msn: Msn) -> Self {
        Self::keyed(MessageKind::AbortBroadcastTxn, msn, Bytes::new(), None)
    }

    /// Reclaim unreachable versions across the leaf.
    pub fn optimize(msn: Msn) -> Self {
        Self::keyed(MessageKind::Optimize, msn, Bytes::new(), None)
    }

    /// Message that only carries a sequence number.
    pub fn noop(msn: Msn) -> Self {
        Self::keyed(MessageKind::None, msn, Bytes::new(), None)
    }

    /// Sets the owning transaction stack while the message is being built.
    pub fn with_xids(mut self, xids: Xids) -> Self {
        self.xids = xids;
        self
    }

    /// Operation kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Target key; empty for broadcasts.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value, delete-both match value, or update extra.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Sequence number the message was issued under.
    pub fn msn(&self) -> Msn {
        self.msn
    }

    /// Owning transaction stack.
    pub fn xids(&self) -> &Xids {
        &self.xids
    }

    pub(crate) fn key_bytes(&self) -> &Bytes {
        &self.key
    }

    pub(crate) fn value_bytes(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }
}
