use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of applier counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStatsSnapshot {
    /// Messages that passed the sequence-number filter.
    pub accepted: u64,
    /// Messages discarded as duplicates or stale re-deliveries.
    pub rejected_stale: u64,
    /// Accepted messages that created, changed, tombstoned or removed an entry.
    pub work_performed: u64,
    /// Superseded versions kept for readers or rollback.
    pub versions_retained: u64,
    /// Versions returned to the arena by supersede or prune.
    pub versions_reclaimed: u64,
}

/// Thread-safe counters owned by whoever drives the applier.
#[derive(Default, Debug)]
pub struct ApplyStats {
    accepted: AtomicU64,
    rejected_stale: AtomicU64,
    work_performed: AtomicU64,
    versions_retained: AtomicU64,
    versions_reclaimed: AtomicU64,
}

impl ApplyStats {
    /// Returns the number of accepted messages.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of stale messages rejected by the filter.
    pub fn rejected_stale(&self) -> u64 {
        self.rejected_stale.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of accepted messages that mutated an entry.
    pub fn work_performed(&self) -> u64 {
        self.work_performed.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of superseded versions that were retained.
    pub fn versions_retained(&self) -> u64 {
        self.versions_retained.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of versions reclaimed.
    pub fn versions_reclaimed(&self) -> u64 {
        self.versions_reclaimed.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_accepted(&self) {
        self.accepted.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_rejected_stale(&self) {
        self.rejected_stale.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_work_performed(&self) {
        self.work_performed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_versions_retained(&self, n: u64) {
        if n > 0 {
            self.versions_retained.fetch_add(n, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn add_versions_reclaimed(&self, n: u64) {
        if n > 0 {
            self.versions_reclaimed.fetch_add(n, AtomicOrdering::Relaxed);
        }
    }

    /// Captures a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> ApplyStatsSnapshot {
        ApplyStatsSnapshot {
            accepted: self.accepted(),
            rejected_stale: self.rejected_stale(),
            work_performed: self.work_performed(),
            versions_retained: self.versions_retained(),
            versions_reclaimed: self.versions_reclaimed(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "fractree::apply::stats",
            accepted = snapshot.accepted,
            rejected_stale = snapshot.rejected_stale,
            work_performed = snapshot.work_performed,
            versions_retained = snapshot.versions_retained,
            versions_reclaimed = snapshot.versions_reclaimed,
            "apply stats snapshot"
        );
    }
}
