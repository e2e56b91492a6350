//! Leaf-level storage: messages, version retention and the apply protocol.

/// Filter-and-apply protocol.
pub mod apply;
/// Key ordering.
pub mod comparator;
/// Leaf partitions and their version arena.
pub mod leaf;
/// Write messages and their kinds.
pub mod message;
/// Sequence number issuance.
pub mod msn;
/// Transaction stacks, version tags and garbage-collection contexts.
pub mod mvcc;

mod options;
mod stats;

pub use apply::{ApplyOutcome, LeafApplier, UpdateAction, UpdateFn};
pub use comparator::{BytewiseComparator, KeyComparator};
pub use leaf::{LeafStore, Payload, PruneStats, Version, VersionIdx};
pub use message::{Message, MessageKind};
pub use msn::MsnAuthority;
pub use mvcc::{GcContext, ReadView, VersionTag, Xids};
pub use options::LeafOptions;
pub use stats::{ApplyStats, ApplyStatsSnapshot};
