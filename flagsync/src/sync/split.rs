use crate::api::{ChangesApi, FetchOptions};
use crate::backoff::Backoff;
use crate::cache::{Caches, Delta, EntityUpdate, RuleBasedSegmentCache, RuleCache, SplitCache};
use crate::config::OnDemandFetchConfig;
use crate::error::SyncError;
use crate::metrics_defs::{SYNC_FETCH_DURATION, SYNC_FETCH_ERRORS};
use crate::types::{ChangeNumber, RuleBasedSegment, RuleChanges, RuleEntity, Split, Status};
use shared::{counter, histogram};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const MAX_GAP_REFETCHES: u32 = 3;

const ON_DEMAND_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Change numbers a push notification asked the rule caches to reach.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchTarget {
    pub flags: Option<ChangeNumber>,
    pub rule_based_segments: Option<ChangeNumber>,
}

impl FetchTarget {
    pub fn flags(change_number: ChangeNumber) -> Self {
        FetchTarget {
            flags: Some(change_number),
            rule_based_segments: None,
        }
    }

    pub fn rule_based_segments(change_number: ChangeNumber) -> Self {
        FetchTarget {
            flags: None,
            rule_based_segments: Some(change_number),
        }
    }

    /// Combines two targets, keeping the highest change number of each cache.
    pub fn merge(self, other: FetchTarget) -> Self {
        FetchTarget {
            flags: self.flags.max(other.flags),
            rule_based_segments: self.rule_based_segments.max(other.rule_based_segments),
        }
    }

    fn till(&self) -> Option<ChangeNumber> {
        self.flags.max(self.rule_based_segments)
    }
}

/// Result of applying an entity delivered inline by a push notification.
#[derive(Clone, Debug, PartialEq)]
pub enum PushOutcome {
    Applied {
        referenced_segments: BTreeSet<String>,
    },
    /// The cache is already at or past the notification.
    Stale,
    /// The entity cannot be applied on its own; a fetch is required.
    NeedsFetch,
}

/// Keeps the flag and rule-based segment caches in step with `/splitChanges`.
///
/// Both the periodic poll and push-triggered fetches go through here. A semaphore
/// serializes them so only one delta is in flight at a time.
pub struct SplitUpdater {
    api: Arc<dyn ChangesApi>,
    splits: Arc<SplitCache>,
    rule_based_segments: Arc<RuleBasedSegmentCache>,
    flag_sets: BTreeSet<String>,
    on_demand: OnDemandFetchConfig,
    update_lock: Semaphore,
}

impl SplitUpdater {
    pub fn new(
        api: Arc<dyn ChangesApi>,
        caches: &Caches,
        flag_sets: BTreeSet<String>,
        on_demand: OnDemandFetchConfig,
    ) -> Self {
        SplitUpdater {
            api,
            splits: caches.splits.clone(),
            rule_based_segments: caches.rule_based_segments.clone(),
            flag_sets,
            on_demand,
            update_lock: Semaphore::new(1),
        }
    }

    /// Fetches until both caches are caught up with the backend.
    ///
    /// Returns the standard segments referenced by the entities that were added.
    pub async fn synchronize(&self, options: &FetchOptions) -> Result<BTreeSet<String>, SyncError> {
        let _permit = self
            .update_lock
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let start = Instant::now();
        let result = self.fetch_until_current(options).await;
        match &result {
            Ok(_) => histogram!(SYNC_FETCH_DURATION, "resource" => "flags")
                .record(start.elapsed().as_secs_f64()),
            Err(_) => counter!(SYNC_FETCH_ERRORS, "resource" => "flags").increment(1),
        }
        result
    }

    async fn fetch_until_current(
        &self,
        options: &FetchOptions,
    ) -> Result<BTreeSet<String>, SyncError> {
        let mut referenced = BTreeSet::new();
        let mut gaps = 0;

        loop {
            let since = self.splits.change_number();
            let rb_since = self.rule_based_segments.change_number();
            let changes = self.api.fetch_rules(since, rb_since, options).await?;

            let caught_up =
                changes.ff.till == changes.ff.since && changes.rbs.till == changes.rbs.since;

            match self.apply(changes) {
                Ok(segments) => referenced.extend(segments),
                Err(SyncError::GapDetected { expected, got }) if gaps < MAX_GAP_REFETCHES => {
                    gaps += 1;
                    tracing::warn!(
                        expected,
                        got,
                        "rule delta does not start at the cache watermark, refetching"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            if caught_up {
                return Ok(referenced);
            }
        }
    }

    fn apply(&self, changes: RuleChanges) -> Result<BTreeSet<String>, SyncError> {
        let RuleChanges { ff, rbs } = changes;

        // Rule-based segments first, so flags referencing them never see them missing
        let rbs = Delta::from_entities(rbs.since, rbs.till, rbs.data, |_| true);
        let mut referenced = self
            .rule_based_segments
            .apply_delta(rbs)?
            .referenced_segments;

        let ff = Delta::from_entities(ff.since, ff.till, ff.data, |split: &Split| {
            split.matches_flag_sets(&self.flag_sets)
        });
        let added = ff.to_add.len();
        let removed = ff.to_remove.len();
        let outcome = self.splits.apply_delta(ff)?;
        if outcome.changed {
            tracing::debug!(
                added,
                removed,
                change_number = self.splits.change_number(),
                "flag cache updated"
            );
        }
        referenced.extend(outcome.referenced_segments);

        Ok(referenced)
    }

    /// Whether both caches already reached the change numbers in `target`.
    pub fn reached(&self, target: &FetchTarget) -> bool {
        target
            .flags
            .is_none_or(|cn| self.splits.change_number() >= cn)
            && target
                .rule_based_segments
                .is_none_or(|cn| self.rule_based_segments.change_number() >= cn)
    }

    /// Fetches until `target` is reached, for updates announced by push.
    ///
    /// Plain no-cache fetches are retried with backoff first. If the CDN keeps
    /// serving older data, the remaining attempts ask for `till` explicitly.
    pub async fn synchronize_with_target(
        &self,
        target: FetchTarget,
    ) -> Result<BTreeSet<String>, SyncError> {
        let mut referenced = BTreeSet::new();
        if self.reached(&target) {
            return Ok(referenced);
        }

        let base = Duration::from_millis(self.on_demand.backoff_ms);
        let mut backoff = Backoff::new(base, ON_DEMAND_BACKOFF_MAX).without_jitter();

        let attempts = self.on_demand.retries + 1;
        let options = FetchOptions::on_demand();
        if self
            .fetch_towards(&target, &options, attempts, &mut backoff, &mut referenced)
            .await?
        {
            return Ok(referenced);
        }

        let Some(till) = target.till() else {
            return Ok(referenced);
        };
        tracing::debug!(till, "target not reached, retrying with CDN bypass");
        backoff.reset();
        let attempts = self.on_demand.cdn_bypass_retries + 1;
        let options = FetchOptions::cdn_bypass(till);
        if !self
            .fetch_towards(&target, &options, attempts, &mut backoff, &mut referenced)
            .await?
        {
            tracing::warn!(?target, "no fetch reached the notified change number");
        }
        Ok(referenced)
    }

    async fn fetch_towards(
        &self,
        target: &FetchTarget,
        options: &FetchOptions,
        attempts: u32,
        backoff: &mut Backoff,
        referenced: &mut BTreeSet<String>,
    ) -> Result<bool, SyncError> {
        for attempt in 1..=attempts {
            match self.synchronize(options).await {
                Ok(segments) => referenced.extend(segments),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, attempt, "on-demand fetch failed");
                }
                Err(e) => return Err(e),
            }

            if self.reached(target) {
                return Ok(true);
            }
            if attempt < attempts {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
        Ok(false)
    }

    /// Applies a flag delivered inline by a push notification.
    ///
    /// `previous` is the change number the notification was computed against. The
    /// flag is applied only if it matches the cache watermark, and only if every
    /// rule-based segment it references is already cached. While a fetch is in
    /// flight the update is not applied inline either; the fetch path covers it.
    pub fn apply_pushed_split(
        &self,
        split: Split,
        previous: Option<ChangeNumber>,
    ) -> Result<PushOutcome, SyncError> {
        let Ok(_permit) = self.update_lock.try_acquire() else {
            return Ok(PushOutcome::NeedsFetch);
        };

        if split.change_number > self.splits.change_number()
            && split
                .rule_based_segment_names()
                .iter()
                .any(|name| self.rule_based_segments.get(name).is_none())
        {
            return Ok(PushOutcome::NeedsFetch);
        }

        let keep = split.matches_flag_sets(&self.flag_sets);
        apply_pushed(&self.splits, split, previous, keep)
    }

    /// Applies a rule-based segment delivered inline by a push notification.
    pub fn apply_pushed_rule_based_segment(
        &self,
        segment: RuleBasedSegment,
        previous: Option<ChangeNumber>,
    ) -> Result<PushOutcome, SyncError> {
        let Ok(_permit) = self.update_lock.try_acquire() else {
            return Ok(PushOutcome::NeedsFetch);
        };

        apply_pushed(&self.rule_based_segments, segment, previous, true)
    }
}

fn apply_pushed<T: RuleEntity>(
    cache: &RuleCache<T>,
    entity: T,
    previous: Option<ChangeNumber>,
    keep: bool,
) -> Result<PushOutcome, SyncError> {
    let current = cache.change_number();
    if entity.change_number() <= current {
        return Ok(PushOutcome::Stale);
    }
    // Without a matching previous change number, changes in between may be missing
    if previous != Some(current) {
        return Ok(PushOutcome::NeedsFetch);
    }

    let referenced_segments = if keep && entity.status() == Status::Active {
        entity.segment_names()
    } else {
        BTreeSet::new()
    };

    let name = entity.name().to_string();
    let change_number = entity.change_number();
    match cache.apply_entity(entity, keep)? {
        EntityUpdate::Applied => {
            tracing::debug!(name, change_number, "applied pushed update");
            Ok(PushOutcome::Applied {
                referenced_segments,
            })
        }
        EntityUpdate::Stale => Ok(PushOutcome::Stale),
    }
}
