//! Per-tree message sequence number issuance.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tracing::{error, trace};

use crate::types::Msn;

/// Issues the sequence number stamped on every write message of one tree.
///
/// Lock-free; shared by reference between all writers of the tree.
#[derive(Debug, Default)]
pub struct MsnAuthority {
    high_water: AtomicU64,
}

impl MsnAuthority {
    /// Resumes issuance strictly above `restored`, the high-water mark read
    /// back from tree metadata.
    pub fn open(restored: Msn) -> Self {
        trace!(target: "fractree::msn", restored = restored.get(), "sequence authority opened");
        Self {
            high_water: AtomicU64::new(restored.get()),
        }
    }

    /// Returns a sequence number greater than any returned or observed before.
    ///
    /// # Panics
    ///
    /// Panics if the 64-bit space is exhausted.
    pub fn next(&self) -> Msn {
        match self
            .high_water
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |cur| {
                cur.checked_add(1)
            }) {
            Ok(prev) => Msn(prev + 1),
            Err(_) => {
                error!(target: "fractree::msn", "message sequence numbers exhausted");
                panic!("message sequence number overflow");
            }
        }
    }

    /// Greatest sequence number issued or observed so far.
    pub fn high_water(&self) -> Msn {
        Msn(self.high_water.load(AtomicOrdering::Acquire))
    }

    /// Raises the high-water mark to at least `msn`.
    pub fn observe(&self, msn: Msn) {
        let prev = self.high_water.fetch_max(msn.get(), AtomicOrdering::AcqRel);
        if prev < msn.get() {
            trace!(target: "fractree::msn", from = prev, to = msn.get(), "high-water mark raised");
        }
    }
}
