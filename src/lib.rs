//! Leaf-mutation core of a message-buffered (fractal) tree index.
//!
//! Write messages are stamped with a per-tree sequence number (MSN) and
//! buffered above the leaves; each leaf remembers the highest MSN it has
//! accepted and discards anything at or below it, so re-delivered and
//! out-of-order messages are applied at most once. Accepted messages mutate a
//! multi-version leaf store whose superseded versions are kept only while a
//! live transaction or reader snapshot can still observe them.
//!
//! The main entry points are [`storage::LeafApplier`] for the filter-and-apply
//! protocol on a single leaf and [`db::Tree`] for a tree handle that issues
//! MSNs, pins leaves and checkpoints them to a [`db::TreeStore`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Tree handle, configuration and persistence.
pub mod db;
/// Shared low-level building blocks.
pub mod primitives;
/// Messages, leaves and the apply protocol.
pub mod storage;
/// Identifiers, errors and checksums.
pub mod types;

pub use db::{Tree, TreeConfig, TreeOptions};
pub use storage::{ApplyOutcome, GcContext, LeafApplier, LeafStore, Message, MessageKind};
pub use types::{FtError, LeafId, Msn, Result, TxnId};
