//! Versioned rule caches.
//!
//! Each cache is shared between the synchronization engine (the only writer) and
//! evaluation callers. A delta is applied under a single write lock, so readers see
//! either the state before it or after it, never a mix.

mod segments;
mod splits;

pub use segments::SegmentCache;
pub use splits::SplitCache;

use crate::error::SyncError;
use crate::types::{ChangeNumber, RuleBasedSegment, RuleEntity, Status, UNSYNCED};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type RuleBasedSegmentCache = RuleCache<RuleBasedSegment>;

/// Handles to the three caches owned by one client instance.
#[derive(Clone, Default)]
pub struct Caches {
    pub splits: Arc<SplitCache>,
    pub rule_based_segments: Arc<RuleBasedSegmentCache>,
    pub segments: Arc<SegmentCache>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freeze(&self) {
        self.splits.freeze();
        self.rule_based_segments.freeze();
        self.segments.freeze();
    }
}

/// A batch of changes moving a cache from `since` to `till`.
#[derive(Clone, Debug, PartialEq)]
pub struct Delta<T> {
    pub since: ChangeNumber,
    pub till: ChangeNumber,
    pub to_add: Vec<T>,
    pub to_remove: Vec<String>,
}

impl<T: RuleEntity> Delta<T> {
    /// Splits fetched entities into upserts and tombstones. Entities rejected by
    /// `keep` are tombstoned like archived ones.
    pub fn from_entities<F>(since: ChangeNumber, till: ChangeNumber, data: Vec<T>, keep: F) -> Self
    where
        F: Fn(&T) -> bool,
    {
        let (to_add, archived): (Vec<T>, Vec<T>) = data
            .into_iter()
            .partition(|e| e.status() == Status::Active && keep(e));

        Delta {
            since,
            till,
            to_add,
            to_remove: archived.into_iter().map(|e| e.name().to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyOutcome {
    /// `false` when the delta was empty and `till == since`.
    pub changed: bool,
    /// Segments referenced by the entities added in this delta.
    pub referenced_segments: BTreeSet<String>,
}

/// Result of applying a single pushed entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityUpdate {
    Applied,
    /// The cache already holds data at or past this change number.
    Stale,
}

struct Inner<T> {
    items: HashMap<String, Arc<T>>,
    change_number: ChangeNumber,
    // segment name -> names of entities referencing it
    segment_refs: HashMap<String, HashSet<String>>,
}

impl<T: RuleEntity> Inner<T> {
    fn insert(&mut self, entity: T) -> BTreeSet<String> {
        let name = entity.name().to_string();
        self.unlink(&name);

        let segments = entity.segment_names();
        for segment in &segments {
            self.segment_refs
                .entry(segment.clone())
                .or_default()
                .insert(name.clone());
        }
        self.items.insert(name, Arc::new(entity));
        segments
    }

    fn remove(&mut self, name: &str) -> bool {
        self.unlink(name);
        self.items.remove(name).is_some()
    }

    fn unlink(&mut self, name: &str) {
        let Some(previous) = self.items.get(name) else {
            return;
        };
        for segment in previous.segment_names() {
            if let Some(names) = self.segment_refs.get_mut(&segment) {
                names.remove(name);
                if names.is_empty() {
                    self.segment_refs.remove(&segment);
                }
            }
        }
    }
}

/// Concurrently readable map of rule sets with one change-number watermark.
pub struct RuleCache<T> {
    inner: RwLock<Inner<T>>,
    frozen: AtomicBool,
}

impl<T: RuleEntity> Default for RuleCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RuleEntity> RuleCache<T> {
    pub fn new() -> Self {
        RuleCache {
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                change_number: UNSYNCED,
                segment_refs: HashMap::new(),
            }),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.inner.read().items.get(name).cloned()
    }

    pub fn put(&self, entity: T) -> Result<(), SyncError> {
        self.check_writable()?;
        self.inner.write().insert(entity);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<bool, SyncError> {
        self.check_writable()?;
        Ok(self.inner.write().remove(name))
    }

    pub fn change_number(&self) -> ChangeNumber {
        self.inner.read().change_number
    }

    pub fn set_change_number(&self, change_number: ChangeNumber) -> Result<(), SyncError> {
        self.check_writable()?;
        self.inner.write().change_number = change_number;
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the entities whose conditions reference `segment`.
    pub fn names_referencing_segment(&self, segment: &str) -> Vec<String> {
        self.inner
            .read()
            .segment_refs
            .get(segment)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every standard segment referenced by a cached entity.
    pub fn segment_names(&self) -> BTreeSet<String> {
        self.inner.read().segment_refs.keys().cloned().collect()
    }

    /// Applies a fetched delta atomically.
    ///
    /// The delta must start at the current watermark, otherwise it is rejected with
    /// `GapDetected` and the cache is left untouched.
    pub fn apply_delta(&self, delta: Delta<T>) -> Result<ApplyOutcome, SyncError> {
        self.check_writable()?;
        let mut inner = self.inner.write();

        if delta.since != inner.change_number {
            return Err(SyncError::GapDetected {
                expected: inner.change_number,
                got: delta.since,
            });
        }

        if delta.till < delta.since {
            return Err(SyncError::MalformedPayload(format!(
                "till {} is behind since {}",
                delta.till, delta.since
            )));
        }

        let mut outcome = ApplyOutcome {
            changed: delta.till != delta.since
                || !delta.to_add.is_empty()
                || !delta.to_remove.is_empty(),
            referenced_segments: BTreeSet::new(),
        };

        for name in &delta.to_remove {
            inner.remove(name);
        }
        for entity in delta.to_add {
            outcome.referenced_segments.extend(inner.insert(entity));
        }
        inner.change_number = delta.till;

        Ok(outcome)
    }

    /// Applies one entity delivered out of band, unless the cache is already at or
    /// past its change number.
    pub fn apply_entity(&self, entity: T, keep: bool) -> Result<EntityUpdate, SyncError> {
        self.check_writable()?;
        let mut inner = self.inner.write();

        let change_number = entity.change_number();
        if change_number <= inner.change_number {
            return Ok(EntityUpdate::Stale);
        }

        if entity.status() == Status::Active && keep {
            inner.insert(entity);
        } else {
            inner.remove(entity.name());
        }
        inner.change_number = change_number;

        Ok(EntityUpdate::Applied)
    }

    /// Rejects every subsequent write. Reads keep returning the last snapshot.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.is_frozen() {
            return Err(SyncError::Frozen);
        }
        Ok(())
    }

    pub(crate) fn with_items<R>(&self, f: impl FnOnce(&HashMap<String, Arc<T>>) -> R) -> R {
        f(&self.inner.read().items)
    }

    pub(crate) fn update_item<F>(&self, name: &str, f: F) -> Result<bool, SyncError>
    where
        F: FnOnce(&T) -> Option<T>,
    {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let Some(updated) = inner.items.get(name).and_then(|item| f(item)) else {
            return Ok(false);
        };
        inner.insert(updated);
        Ok(true)
    }
}
