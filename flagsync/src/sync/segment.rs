use crate::api::{ChangesApi, FetchOptions};
use crate::backoff::Backoff;
use crate::cache::SegmentCache;
use crate::config::OnDemandFetchConfig;
use crate::error::SyncError;
use crate::metrics_defs::{SYNC_FETCH_DURATION, SYNC_FETCH_ERRORS, SYNC_SEGMENT_KEYS};
use crate::types::ChangeNumber;
use indexmap::IndexSet;
use parking_lot::Mutex;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_GAP_REFETCHES: u32 = 3;

const ON_DEMAND_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Segment names the engine keeps fetching, in discovery order.
///
/// Names are only ever added: a flag can be deleted and later re-added referencing
/// the same segment.
#[derive(Default)]
pub struct SegmentRegistry {
    names: Mutex<IndexSet<String>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `names` and returns the ones that were not known yet.
    pub fn register<I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut known = self.names.lock();
        names
            .into_iter()
            .filter(|name| known.insert(name.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().iter().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brings one segment at a time up to date with `/segmentChanges/{name}`.
pub struct SegmentUpdater {
    api: Arc<dyn ChangesApi>,
    segments: Arc<SegmentCache>,
    on_demand: OnDemandFetchConfig,
}

impl SegmentUpdater {
    pub fn new(
        api: Arc<dyn ChangesApi>,
        segments: Arc<SegmentCache>,
        on_demand: OnDemandFetchConfig,
    ) -> Self {
        SegmentUpdater {
            api,
            segments,
            on_demand,
        }
    }

    pub fn change_number(&self, name: &str) -> ChangeNumber {
        self.segments.change_number(name)
    }

    /// Fetches deltas for `name` until `till == since`.
    pub async fn synchronize_segment(
        &self,
        name: &str,
        options: &FetchOptions,
    ) -> Result<(), SyncError> {
        let start = Instant::now();
        let result = self.fetch_until_current(name, options).await;
        match &result {
            Ok(()) => histogram!(SYNC_FETCH_DURATION, "resource" => "segments")
                .record(start.elapsed().as_secs_f64()),
            Err(_) => counter!(SYNC_FETCH_ERRORS, "resource" => "segments").increment(1),
        }
        result
    }

    async fn fetch_until_current(&self, name: &str, options: &FetchOptions) -> Result<(), SyncError> {
        let mut gaps = 0;

        loop {
            let since = self.segments.change_number(name);
            let mut changes = self.api.fetch_segment(name, since, options).await?;
            changes.name = name.to_string();

            match self.segments.apply_delta(&changes) {
                Ok(outcome) => {
                    if outcome.changed {
                        let keys = changes.added.len() + changes.removed.len();
                        histogram!(SYNC_SEGMENT_KEYS).record(keys as f64);
                        tracing::debug!(
                            segment = name,
                            added = changes.added.len(),
                            removed = changes.removed.len(),
                            change_number = changes.till,
                            "segment updated"
                        );
                    }
                }
                Err(SyncError::GapDetected { expected, got }) if gaps < MAX_GAP_REFETCHES => {
                    gaps += 1;
                    tracing::warn!(segment = name, expected, got, "segment delta gap, refetching");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if changes.till == changes.since {
                return Ok(());
            }
        }
    }

    /// Fetches `name` until it reaches `target`, retrying with backoff and then
    /// with a CDN bypass.
    pub async fn synchronize_segment_with_target(
        &self,
        name: &str,
        target: ChangeNumber,
    ) -> Result<(), SyncError> {
        if self.segments.change_number(name) >= target {
            return Ok(());
        }

        let base = Duration::from_millis(self.on_demand.backoff_ms);
        let mut backoff = Backoff::new(base, ON_DEMAND_BACKOFF_MAX).without_jitter();

        let plans = [
            (FetchOptions::on_demand(), self.on_demand.retries + 1),
            (
                FetchOptions::cdn_bypass(target),
                self.on_demand.cdn_bypass_retries + 1,
            ),
        ];

        for (options, attempts) in plans {
            backoff.reset();
            for attempt in 1..=attempts {
                match self.synchronize_segment(name, &options).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(segment = name, error = %e, attempt, "on-demand segment fetch failed");
                    }
                    Err(e) => return Err(e),
                }
                if self.segments.change_number(name) >= target {
                    return Ok(());
                }
                if attempt < attempts {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }

        tracing::warn!(segment = name, target, "no fetch reached the notified change number");
        Ok(())
    }
}
