//! Filter-and-apply protocol run once per (message, leaf) pair.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::storage::comparator::KeyComparator;
use crate::storage::leaf::{LeafStore, Payload, PruneStats};
use crate::storage::message::{Message, MessageKind};
use crate::storage::mvcc::{GcContext, VersionTag, Xids};
use crate::storage::options::LeafOptions;
use crate::storage::stats::ApplyStats;
use crate::types::Result;

/// Result of an update function invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateAction {
    /// Leave the key as it is.
    Unchanged,
    /// Install a new value.
    Set(Bytes),
    /// Delete the key.
    Delete,
}

/// Tree-configured transformation run for `Update` and `UpdateBroadcast` messages.
pub trait UpdateFn: Send + Sync {
    /// Computes the new state of `key` from its current value and the message extra.
    fn update(&self, key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> UpdateAction;
}

impl<F> UpdateFn for F
where
    F: Fn(&[u8], Option<&[u8]>, &[u8]) -> UpdateAction + Send + Sync,
{
    fn update(&self, key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> UpdateAction {
        self(key, old, extra)
    }
}

/// What one `apply` call did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ApplyOutcome {
    /// The message passed the sequence-number filter.
    pub applied: bool,
    /// An entry was created, changed, tombstoned or removed.
    pub work_performed: bool,
}

impl ApplyOutcome {
    /// Outcome of a stale or duplicate message.
    pub const REJECTED: ApplyOutcome = ApplyOutcome {
        applied: false,
        work_performed: false,
    };
}

#[derive(Clone, Copy, Debug, Default)]
struct Effect {
    work: bool,
    retained: u64,
    reclaimed: u64,
}

impl Effect {
    const NONE: Effect = Effect {
        work: false,
        retained: 0,
        reclaimed: 0,
    };

    fn touched() -> Self {
        Effect {
            work: true,
            ..Effect::NONE
        }
    }

    fn absorb(&mut self, other: Effect) {
        self.work |= other.work;
        self.retained += other.retained;
        self.reclaimed += other.reclaimed;
    }

    fn pruned(&mut self, stats: PruneStats) {
        self.reclaimed += stats.versions_reclaimed as u64;
    }
}

/// Applies messages to leaves, discarding those a leaf has already seen.
///
/// Holds no per-leaf state; callers pass the leaf by exclusive reference.
#[derive(Clone)]
pub struct LeafApplier {
    cmp: Arc<dyn KeyComparator>,
    update: Option<Arc<dyn UpdateFn>>,
    options: LeafOptions,
    stats: Arc<ApplyStats>,
}

impl LeafApplier {
    /// Creates an applier ordering keys with `cmp`.
    pub fn new(cmp: Arc<dyn KeyComparator>) -> Self {
        Self {
            cmp,
            update: None,
            options: LeafOptions::default(),
            stats: Arc::new(ApplyStats::default()),
        }
    }

    /// Installs the update function used by update messages.
    pub fn with_update_fn(mut self, update: Arc<dyn UpdateFn>) -> Self {
        self.update = Some(update);
        self
    }

    /// Replaces the leaf options.
    pub fn with_options(mut self, options: LeafOptions) -> Self {
        self.options = options;
        self
    }

    /// Shares an externally owned counter set.
    pub fn with_stats(mut self, stats: Arc<ApplyStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Key order used for every lookup.
    pub fn comparator(&self) -> &dyn KeyComparator {
        self.cmp.as_ref()
    }

    /// Counters updated by [`LeafApplier::apply`].
    pub fn stats(&self) -> &Arc<ApplyStats> {
        &self.stats
    }

    /// Active leaf options.
    pub fn options(&self) -> &LeafOptions {
        &self.options
    }

    /// Applies `msg` to `leaf` unless its sequence number is at or below the
    /// leaf's watermark.
    ///
    /// An accepted message always advances the watermark to its own sequence
    /// number and dirties the leaf, whether or not any entry changed. On error
    /// the leaf is left exactly as it was.
    pub fn apply(&self, msg: &Message, gc: &GcContext, leaf: &mut LeafStore) -> Result<ApplyOutcome> {
        let watermark = leaf.max_msn_applied();
        if msg.msn() <= watermark {
            self.stats.inc_rejected_stale();
            trace!(
                target: "fractree::apply",
                msn = msg.msn().get(),
                watermark = watermark.get(),
                kind = msg.kind().name(),
                "discarding stale message"
            );
            return Ok(ApplyOutcome::REJECTED);
        }

        let effect = match self.mutate(msg, gc, leaf) {
            Ok(effect) => effect,
            Err(err) => {
                debug!(
                    target: "fractree::apply",
                    msn = msg.msn().get(),
                    kind = msg.kind().name(),
                    error = %err,
                    "message not applied"
                );
                return Err(err);
            }
        };
        leaf.advance_watermark(msg.msn());
        leaf.mark_dirty();

        self.stats.inc_accepted();
        if effect.work {
            self.stats.inc_work_performed();
        }
        self.stats.add_versions_retained(effect.retained);
        self.stats.add_versions_reclaimed(effect.reclaimed);
        trace!(
            target: "fractree::apply",
            msn = msg.msn().get(),
            kind = msg.kind().name(),
            work = effect.work,
            "applied message"
        );
        Ok(ApplyOutcome {
            applied: true,
            work_performed: effect.work,
        })
    }

    fn mutate(&self, msg: &Message, gc: &GcContext, leaf: &mut LeafStore) -> Result<Effect> {
        match msg.kind() {
            MessageKind::Insert | MessageKind::InsertOverwrite => self.put(msg, gc, leaf, true),
            MessageKind::InsertNoOverwrite => self.put(msg, gc, leaf, false),
            MessageKind::DeleteAny => self.delete(msg, gc, leaf, None),
            MessageKind::DeleteBoth => self.delete(msg, gc, leaf, Some(payload_of(msg))),
            MessageKind::Update => self.update_one(msg, gc, leaf),
            MessageKind::UpdateBroadcast => self.update_all(msg, gc, leaf),
            MessageKind::CommitAny => Ok(self.resolve_one(msg, gc, leaf, Resolve::Commit)),
            MessageKind::AbortAny => Ok(self.resolve_one(msg, gc, leaf, Resolve::Abort)),
            MessageKind::CommitBroadcastAll => Ok(resolve_all(leaf, gc, Resolve::CommitAll)),
            MessageKind::CommitBroadcastTxn => {
                Ok(resolve_all(leaf, gc, Resolve::CommitTxn(msg.xids())))
            }
            MessageKind::AbortBroadcastTxn => {
                Ok(resolve_all(leaf, gc, Resolve::AbortTxn(msg.xids())))
            }
            MessageKind::Optimize => {
                let stats = leaf.prune(gc);
                let mut effect = Effect {
                    work: stats.versions_reclaimed > 0,
                    ..Effect::NONE
                };
                effect.pruned(stats);
                Ok(effect)
            }
            MessageKind::None => Ok(Effect::NONE),
        }
    }

    fn put(&self, msg: &Message, gc: &GcContext, leaf: &mut LeafStore, overwrite: bool) -> Result<Effect> {
        let found = leaf.find(self.comparator(), msg.key());
        if let Ok(pos) = found {
            if !overwrite && leaf.current_value(pos).is_some() {
                return Ok(Effect::NONE);
            }
        }
        let tag = VersionTag::for_write(msg.xids());
        self.reserve_for(leaf, found, &tag, gc)?;
        let value = Payload::Value(payload_bytes(msg).clone());
        Ok(self.write_version(leaf, found, msg.key_bytes(), value, tag, gc))
    }

    fn delete(
        &self,
        msg: &Message,
        gc: &GcContext,
        leaf: &mut LeafStore,
        must_match: Option<&[u8]>,
    ) -> Result<Effect> {
        let Ok(pos) = leaf.find(self.comparator(), msg.key()) else {
            return Ok(Effect::NONE);
        };
        let matches = match leaf.current_value(pos) {
            None => false,
            Some(current) => must_match.map_or(true, |expected| current == expected),
        };
        if !matches {
            return Ok(Effect::NONE);
        }
        let tag = VersionTag::for_write(msg.xids());
        self.reserve_for(leaf, Ok(pos), &tag, gc)?;
        Ok(self.write_version(leaf, Ok(pos), msg.key_bytes(), Payload::Tombstone, tag, gc))
    }

    fn update_one(&self, msg: &Message, gc: &GcContext, leaf: &mut LeafStore) -> Result<Effect> {
        let update = self.update_fn(msg);
        let found = leaf.find(self.comparator(), msg.key());
        let old = found.ok().and_then(|pos| leaf.current_value(pos));
        let payload = match update.update(msg.key(), old, payload_of(msg)) {
            UpdateAction::Unchanged => return Ok(Effect::NONE),
            UpdateAction::Set(value) => Payload::Value(value),
            UpdateAction::Delete if old.is_none() => return Ok(Effect::NONE),
            UpdateAction::Delete => Payload::Tombstone,
        };
        let tag = VersionTag::for_write(msg.xids());
        self.reserve_for(leaf, found, &tag, gc)?;
        Ok(self.write_version(leaf, found, msg.key_bytes(), payload, tag, gc))
    }

    fn update_all(&self, msg: &Message, gc: &GcContext, leaf: &mut LeafStore) -> Result<Effect> {
        let update = self.update_fn(msg);
        let extra = payload_of(msg);
        let tag = VersionTag::for_write(msg.xids());
        // Worst case every live key gets a new version; reserving it up front
        // keeps a failure side-effect free.
        let growth = (0..leaf.len())
            .filter(|&pos| leaf.current_value(pos).is_some() && leaf.would_retain(pos, &tag, gc))
            .count();
        leaf.reserve(growth, 0, self.options.max_versions)?;
        let mut effect = Effect::NONE;
        let mut pos = 0;
        while pos < leaf.len() {
            let key = leaf.key_at(pos).clone();
            let Some(old) = leaf.current_value(pos) else {
                pos += 1;
                continue;
            };
            let payload = match update.update(&key, Some(old), extra) {
                UpdateAction::Unchanged => {
                    pos += 1;
                    continue;
                }
                UpdateAction::Set(value) => Payload::Value(value),
                UpdateAction::Delete => Payload::Tombstone,
            };
            let before = leaf.len();
            effect.absorb(self.write_version(leaf, Ok(pos), &key, payload, tag.clone(), gc));
            if leaf.len() == before {
                pos += 1;
            }
        }
        Ok(effect)
    }

    /// Reserves room for one version written with `tag` at `found`. A superseded
    /// head the GC context lets go frees the slot the new version takes.
    fn reserve_for(
        &self,
        leaf: &mut LeafStore,
        found: std::result::Result<usize, usize>,
        tag: &VersionTag,
        gc: &GcContext,
    ) -> Result<()> {
        let (versions, entries) = match found {
            Ok(pos) => (usize::from(leaf.would_retain(pos, tag, gc)), 0),
            Err(_) => (1, 1),
        };
        leaf.reserve(versions, entries, self.options.max_versions)
    }

    /// Installs `payload` as the newest version of the key at `found`.
    /// Capacity must already be reserved with [`LeafApplier::reserve_for`].
    fn write_version(
        &self,
        leaf: &mut LeafStore,
        found: std::result::Result<usize, usize>,
        key: &Bytes,
        payload: Payload,
        tag: VersionTag,
        gc: &GcContext,
    ) -> Effect {
        match found {
            Ok(pos) => {
                let tombstone = payload.is_tombstone();
                let retained = leaf.supersede(pos, payload, tag, gc);
                let mut effect = Effect::touched();
                if retained {
                    effect.retained += 1;
                } else {
                    effect.reclaimed += 1;
                }
                if tombstone && leaf.drop_if_dead(pos) {
                    effect.reclaimed += 1;
                } else if self.options.prune_on_apply {
                    effect.pruned(leaf.prune_entry(pos, gc));
                }
                effect
            }
            Err(_) if payload.is_tombstone() => Effect::NONE,
            Err(pos) => {
                leaf.insert_entry(self.comparator(), pos, key.clone(), payload, tag);
                Effect::touched()
            }
        }
    }

    fn resolve_one(&self, msg: &Message, gc: &GcContext, leaf: &mut LeafStore, how: Resolve<'_>) -> Effect {
        let Ok(pos) = leaf.find(self.comparator(), msg.key()) else {
            return Effect::NONE;
        };
        let (changed, _) = how.run(leaf, pos, gc, msg.xids());
        Effect {
            work: changed,
            ..Effect::NONE
        }
    }

    fn update_fn(&self, msg: &Message) -> &dyn UpdateFn {
        match self.update.as_deref() {
            Some(update) => update,
            None => {
                error!(
                    target: "fractree::apply",
                    msn = msg.msn().get(),
                    "update message reached a tree without an update function"
                );
                panic!(
                    "update message {} applied without an update function",
                    msg.msn()
                );
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Resolve<'a> {
    Commit,
    Abort,
    CommitAll,
    CommitTxn(&'a Xids),
    AbortTxn(&'a Xids),
}

impl Resolve<'_> {
    fn run(self, leaf: &mut LeafStore, pos: usize, gc: &GcContext, sender: &Xids) -> (bool, bool) {
        match self {
            Resolve::Commit => leaf.commit_in_entry(pos, Some(sender), gc),
            Resolve::CommitTxn(xids) => leaf.commit_in_entry(pos, Some(xids), gc),
            Resolve::CommitAll => leaf.commit_in_entry(pos, None, gc),
            Resolve::Abort => leaf.abort_in_entry(pos, sender),
            Resolve::AbortTxn(xids) => leaf.abort_in_entry(pos, xids),
        }
    }
}

fn resolve_all(leaf: &mut LeafStore, gc: &GcContext, how: Resolve<'_>) -> Effect {
    let root = Xids::root();
    let mut effect = Effect::NONE;
    let mut pos = 0;
    while pos < leaf.len() {
        let (changed, removed) = how.run(leaf, pos, gc, &root);
        effect.work |= changed;
        if !removed {
            pos += 1;
        }
    }
    effect
}

fn payload_of(msg: &Message) -> &[u8] {
    payload_bytes(msg)
}

fn payload_bytes(msg: &Message) -> &Bytes {
    match msg.value_bytes() {
        Some(value) => value,
        None => {
            error!(
                target: "fractree::apply",
                msn = msg.msn().get(),
                kind = msg.kind().name(),
                "message is missing its value"
            );
            panic!("{} message {} carries no value", msg.kind().name(), msg.msn());
        }
    }
}
