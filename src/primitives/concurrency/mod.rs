//! Pin manager granting exclusive, guard-scoped access to leaf partitions.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use tracing::trace;

use crate::storage::LeafStore;
use crate::types::{FtError, LeafId, Result};

/// Resident leaves of one tree, each behind its own mutex.
///
/// Pinning different leaves never contends; pinning the same leaf twice
/// blocks until the first guard is dropped.
#[derive(Default)]
pub struct LeafCache {
    slots: Mutex<HashMap<LeafId, Arc<Mutex<LeafStore>>>>,
    metrics: Arc<PinMetrics>,
}

#[derive(Default)]
struct PinMetrics {
    pinned: AtomicUsize,
    pins_total: AtomicU64,
}

/// Counters describing pin activity.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSnapshot {
    /// Guards currently alive.
    pub pinned: usize,
    /// Pins granted since the cache was created.
    pub pins_total: u64,
}

/// Exclusive access to one resident leaf. Dropping the guard unpins it.
pub struct PinnedLeaf {
    id: LeafId,
    guard: ArcMutexGuard<RawMutex, LeafStore>,
    metrics: Arc<PinMetrics>,
}

impl PinnedLeaf {
    /// Identifier of the pinned leaf.
    pub fn id(&self) -> LeafId {
        self.id
    }

    /// Flags the leaf for write-back at the next checkpoint.
    pub fn mark_dirty(&mut self) {
        self.guard.mark_dirty();
    }
}

impl Deref for PinnedLeaf {
    type Target = LeafStore;

    fn deref(&self) -> &LeafStore {
        &self.guard
    }
}

impl DerefMut for PinnedLeaf {
    fn deref_mut(&mut self) -> &mut LeafStore {
        &mut self.guard
    }
}

impl Drop for PinnedLeaf {
    fn drop(&mut self) {
        self.metrics.pinned.fetch_sub(1, AtomicOrdering::Relaxed);
        trace!(target: "fractree::tree", leaf = self.id.0, "unpinned leaf");
    }
}

impl LeafCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `leaf` resident under `id`. Fails if `id` is already resident.
    pub fn insert(&self, id: LeafId, leaf: LeafStore) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(FtError::Invalid("leaf already resident"));
        }
        slots.insert(id, Arc::new(Mutex::new(leaf)));
        Ok(())
    }

    /// Returns `true` if `id` is resident.
    pub fn contains(&self, id: LeafId) -> bool {
        self.slots.lock().contains_key(&id)
    }

    /// Number of resident leaves.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` when no leaf is resident.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Resident leaf ids in ascending order.
    pub fn leaf_ids(&self) -> Vec<LeafId> {
        let mut ids: Vec<LeafId> = self.slots.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Pins a resident leaf, blocking while another guard holds it.
    pub fn pin(&self, id: LeafId) -> Result<PinnedLeaf> {
        let slot = self.slot(id).ok_or(FtError::NotFound)?;
        Ok(self.wrap(id, slot.lock_arc()))
    }

    /// Pins a resident leaf only if nobody else holds it.
    pub fn try_pin(&self, id: LeafId) -> Result<Option<PinnedLeaf>> {
        let slot = self.slot(id).ok_or(FtError::NotFound)?;
        Ok(slot.try_lock_arc().map(|guard| self.wrap(id, guard)))
    }

    /// Pins `id`, materializing it with `load` first if it is not resident.
    ///
    /// `load` runs without the cache map locked, so other leaves stay pinnable
    /// during a cold load. When two callers race on the same miss, the first
    /// insert wins and the other loaded copy is discarded.
    pub fn pin_or_load<F>(&self, id: LeafId, load: F) -> Result<PinnedLeaf>
    where
        F: FnOnce() -> Result<LeafStore>,
    {
        if let Some(slot) = self.slot(id) {
            return Ok(self.wrap(id, slot.lock_arc()));
        }
        let loaded = Arc::new(Mutex::new(load()?));
        let slot = Arc::clone(self.slots.lock().entry(id).or_insert(loaded));
        Ok(self.wrap(id, slot.lock_arc()))
    }

    /// Current pin counters.
    pub fn snapshot(&self) -> PinSnapshot {
        PinSnapshot {
            pinned: self.metrics.pinned.load(AtomicOrdering::Relaxed),
            pins_total: self.metrics.pins_total.load(AtomicOrdering::Relaxed),
        }
    }

    fn slot(&self, id: LeafId) -> Option<Arc<Mutex<LeafStore>>> {
        self.slots.lock().get(&id).cloned()
    }

    fn wrap(&self, id: LeafId, guard: ArcMutexGuard<RawMutex, LeafStore>) -> PinnedLeaf {
        self.metrics.pinned.fetch_add(1, AtomicOrdering::Relaxed);
        self.metrics.pins_total.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "fractree::tree", leaf = id.0, "pinned leaf");
        PinnedLeaf {
            id,
            guard,
            metrics: Arc::clone(&self.metrics),
        }
    }
}
