//! Low-level building blocks shared by the storage and tree layers.

/// Varint and cursor helpers for binary images.
pub mod bytes;
/// Pin manager for exclusive leaf access.
pub mod concurrency;
