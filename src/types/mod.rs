#![forbid(unsafe_code)]
//! Identifiers, the crate error type and checksum helpers.

use std::fmt;

/// CRC32 helpers used by on-disk images.
pub mod checksum;

pub use checksum::image_crc32;

/// Message sequence number.
///
/// Totally orders every write issued against one tree. Zero is never issued
/// and marks a leaf that has not accepted any message yet.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Msn(pub u64);

impl Msn {
    /// Watermark of a leaf that has never accepted a message.
    pub const ZERO: Msn = Msn(0);

    /// Returns the raw integer.
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Transaction identifier. [`TxnId::NONE`] is the root (non-transactional) context.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Root context, also used as "no transaction" in GC contexts.
    pub const NONE: TxnId = TxnId(0);

    /// Returns `true` for [`TxnId::NONE`].
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Identifier of a leaf partition inside one tree.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LeafId(pub u64);

/// Errors surfaced by the leaf core and its storage collaborators.
#[derive(thiserror::Error, Debug)]
pub enum FtError {
    /// Underlying filesystem failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// Retaining another version would exceed the leaf's configured limit.
    #[error("version limit reached: {live} live versions, limit {limit}")]
    VersionLimit {
        /// Versions currently held by the leaf.
        live: usize,
        /// Configured maximum.
        limit: usize,
    },
    /// The allocator refused to grow the version arena.
    #[error("out of memory while retaining versions")]
    OutOfMemory,
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
}

impl FtError {
    /// Returns `true` for errors a caller can recover from by pruning and retrying.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, FtError::VersionLimit { .. } | FtError::OutOfMemory)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FtError>;

impl fmt::Display for Msn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Msn {
    fn from(value: u64) -> Self {
        Msn(value)
    }
}

impl From<u64> for TxnId {
    fn from(value: u64) -> Self {
        TxnId(value)
    }
}
