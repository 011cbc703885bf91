use super::ApplyOutcome;
use crate::error::SyncError;
use crate::types::{ChangeNumber, SegmentChanges, UNSYNCED};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct SegmentData {
    members: HashSet<String>,
    change_number: ChangeNumber,
}

/// Explicit-membership segments, each with its own watermark.
///
/// The outer map is only write-locked to register a new segment; member updates
/// lock the single segment they touch.
#[derive(Default)]
pub struct SegmentCache {
    segments: RwLock<HashMap<String, Arc<RwLock<SegmentData>>>>,
    frozen: AtomicBool,
}

impl SegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` belongs to `segment`. `None` if the segment was never fetched.
    pub fn contains(&self, segment: &str, key: &str) -> Option<bool> {
        let data = self.segments.read().get(segment).cloned()?;
        let guard = data.read();
        Some(guard.members.contains(key))
    }

    pub fn change_number(&self, segment: &str) -> ChangeNumber {
        self.segments
            .read()
            .get(segment)
            .map(|data| data.read().change_number)
            .unwrap_or(UNSYNCED)
    }

    pub fn set_change_number(
        &self,
        segment: &str,
        change_number: ChangeNumber,
    ) -> Result<(), SyncError> {
        self.check_writable()?;
        self.entry(segment).write().change_number = change_number;
        Ok(())
    }

    pub fn segment_names(&self) -> BTreeSet<String> {
        self.segments.read().keys().cloned().collect()
    }

    pub fn member_count(&self, segment: &str) -> usize {
        self.segments
            .read()
            .get(segment)
            .map(|data| data.read().members.len())
            .unwrap_or(0)
    }

    /// Applies one `segmentChanges` response.
    ///
    /// Removals are applied before additions so a key listed in both ends up a
    /// member. The delta must start at the segment's current watermark.
    pub fn apply_delta(&self, changes: &SegmentChanges) -> Result<ApplyOutcome, SyncError> {
        self.check_writable()?;
        let data = self.entry(&changes.name);
        let mut guard = data.write();

        if changes.since != guard.change_number {
            return Err(SyncError::GapDetected {
                expected: guard.change_number,
                got: changes.since,
            });
        }

        if changes.till < changes.since {
            return Err(SyncError::MalformedPayload(format!(
                "segment {}: till {} is behind since {}",
                changes.name, changes.till, changes.since
            )));
        }

        for key in &changes.removed {
            guard.members.remove(key);
        }
        guard.members.extend(changes.added.iter().cloned());
        guard.change_number = changes.till;

        Ok(ApplyOutcome {
            changed: changes.till != changes.since
                || !changes.added.is_empty()
                || !changes.removed.is_empty(),
            referenced_segments: BTreeSet::new(),
        })
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(SyncError::Frozen);
        }
        Ok(())
    }

    fn entry(&self, segment: &str) -> Arc<RwLock<SegmentData>> {
        if let Some(data) = self.segments.read().get(segment) {
            return data.clone();
        }
        self.segments
            .write()
            .entry(segment.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(SegmentData {
                    members: HashSet::new(),
                    change_number: UNSYNCED,
                }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(since: i64, till: i64, added: &[&str], removed: &[&str]) -> SegmentChanges {
        SegmentChanges {
            name: "employees".into(),
            since,
            till,
            added: added.iter().map(|s| s.to_string()).collect(),
            removed: removed.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn members(cache: &SegmentCache) -> BTreeSet<&'static str> {
        ["a", "b", "c", "d"]
            .into_iter()
            .filter(|k| cache.contains("employees", k) == Some(true))
            .collect()
    }

    #[test]
    fn test_unknown_segment() {
        let cache = SegmentCache::new();
        assert_eq!(cache.contains("employees", "a"), None);
        assert_eq!(cache.change_number("employees"), UNSYNCED);
    }

    #[test]
    fn test_apply_deltas_in_sequence() {
        let cache = SegmentCache::new();
        cache.apply_delta(&changes(-1, 10, &["a", "b"], &["c"])).unwrap();
        cache.apply_delta(&changes(10, 20, &["c"], &["a"])).unwrap();

        assert_eq!(members(&cache), BTreeSet::from(["b", "c"]));
        assert_eq!(cache.change_number("employees"), 20);
        assert_eq!(cache.member_count("employees"), 2);
    }

    #[test]
    fn test_order_within_delta_does_not_matter() {
        let forward = SegmentCache::new();
        forward.apply_delta(&changes(-1, 10, &["a", "b"], &["c"])).unwrap();
        forward.apply_delta(&changes(10, 20, &["c"], &["a"])).unwrap();

        let reversed = SegmentCache::new();
        reversed.apply_delta(&changes(-1, 10, &["b", "a"], &["c"])).unwrap();
        reversed.apply_delta(&changes(10, 20, &["c"], &["a"])).unwrap();

        assert_eq!(members(&forward), members(&reversed));
    }

    #[test]
    fn test_gap_rejected() {
        let cache = SegmentCache::new();
        cache.apply_delta(&changes(-1, 10, &["a"], &[])).unwrap();

        let err = cache.apply_delta(&changes(15, 20, &["b"], &[])).unwrap_err();
        assert_eq!(
            err,
            SyncError::GapDetected {
                expected: 10,
                got: 15
            }
        );
        assert_eq!(members(&cache), BTreeSet::from(["a"]));
        assert_eq!(cache.change_number("employees"), 10);
    }

    #[test]
    fn test_overlap_resolves_as_added() {
        let cache = SegmentCache::new();
        cache.apply_delta(&changes(-1, 10, &["a"], &["a"])).unwrap();
        assert_eq!(cache.contains("employees", "a"), Some(true));
    }

    #[test]
    fn test_frozen() {
        let cache = SegmentCache::new();
        cache.freeze();
        assert_eq!(
            cache.apply_delta(&changes(-1, 10, &["a"], &[])),
            Err(SyncError::Frozen)
        );
    }
}
