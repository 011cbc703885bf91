use super::task::{TaskHandle, spawn_periodic};
use super::workers::{SegmentWorkerPool, start_split_worker, sweep_segments};
use super::{SegmentRegistry, SegmentUpdater, SplitUpdater, shutdown_channel};
use crate::api::{AuthApi, ChangesApi, FetchOptions};
use crate::cache::Caches;
use crate::config::{Config, ValidationError};
use crate::push::{PushManager, StatusPublisher, StreamConnector, StreamingStatus, UpdateDispatcher};
use crate::readiness::{ReadinessGates, Resource};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote collaborators of the engine.
#[derive(Clone)]
pub struct Backends {
    pub changes: Arc<dyn ChangesApi>,
    pub auth: Arc<dyn AuthApi>,
    pub connector: Arc<dyn StreamConnector>,
}

/// Current interval of the flag and segment polling tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollingIntervals {
    pub flags: Duration,
    pub segments: Duration,
}

/// Switches polling between the fast cadence and the safety sweep as push
/// health changes.
#[derive(Clone)]
struct Cadence {
    flags: TaskHandle,
    segments: TaskHandle,
    fast: PollingIntervals,
    safety: Duration,
}

impl Cadence {
    fn apply(&self, status: StreamingStatus) {
        if status.is_push_healthy() {
            self.flags.set_interval(self.safety);
            self.segments.set_interval(self.safety);
            return;
        }

        let relaxed = self.flags.interval() != self.fast.flags;
        self.flags.set_interval(self.fast.flags);
        self.segments.set_interval(self.fast.segments);
        if relaxed {
            // Push may have missed updates: poll now rather than at the next tick
            self.flags.trigger();
            self.segments.trigger();
        }
    }

    fn intervals(&self) -> PollingIntervals {
        PollingIntervals {
            flags: self.flags.interval(),
            segments: self.segments.interval(),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    cadence: Cadence,
    tasks: Vec<JoinHandle<()>>,
    pool: SegmentWorkerPool,
}

/// Starts and stops every background task of the engine.
///
/// Polling starts right away so the caches fill even without push. When
/// streaming is enabled, status transitions from the push manager move polling
/// between the fast interval and the safety interval.
pub struct SyncManager {
    config: Config,
    backends: Backends,
    caches: Caches,
    gates: Arc<ReadinessGates>,
    publisher: StatusPublisher,
    registry: Arc<SegmentRegistry>,
    running: Mutex<Option<Running>>,
}

impl SyncManager {
    pub fn new(
        config: Config,
        backends: Backends,
        caches: Caches,
        gates: Arc<ReadinessGates>,
        publisher: StatusPublisher,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(SyncManager {
            config,
            backends,
            caches,
            gates,
            publisher,
            registry: Arc::new(SegmentRegistry::new()),
            running: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// Launches polling, the segment workers and, if enabled, push.
    ///
    /// Must be called from within a tokio runtime. Calling it again while running
    /// does nothing.
    pub fn start(&self) -> Result<(), ValidationError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let flag_sets = self.config.flag_sets()?;
        let on_demand = self.config.on_demand_fetch.clone();
        let (shutdown_tx, shutdown) = shutdown_channel();

        let splits = Arc::new(SplitUpdater::new(
            self.backends.changes.clone(),
            &self.caches,
            flag_sets,
            on_demand.clone(),
        ));
        let segments = Arc::new(SegmentUpdater::new(
            self.backends.changes.clone(),
            self.caches.segments.clone(),
            on_demand,
        ));
        let (segment_queue, pool) =
            SegmentWorkerPool::start(self.config.segment_workers, segments, shutdown.clone());

        let (segments_task, segments_join) = {
            let queue = segment_queue.clone();
            let registry = self.registry.clone();
            let gates = self.gates.clone();
            spawn_periodic(
                "segments",
                self.config.segments_refresh_rate(),
                shutdown.clone(),
                move || {
                    let queue = queue.clone();
                    let registry = registry.clone();
                    let gates = gates.clone();
                    async move {
                        // Segments referenced by flags fetched later are not covered by this sweep
                        let flags_ready = gates.is_ready(Resource::Flags);
                        match sweep_segments(&queue, &registry).await {
                            Ok(()) if flags_ready => {
                                gates.mark_ready(Resource::Segments);
                            }
                            Ok(()) => {}
                            Err(e) => tracing::warn!(error = %e, "segment sweep incomplete"),
                        }
                    }
                },
            )
        };

        let (flags_task, flags_join) = {
            let splits = splits.clone();
            let queue = segment_queue.clone();
            let registry = self.registry.clone();
            let gates = self.gates.clone();
            let segments_task = segments_task.clone();
            spawn_periodic(
                "flags",
                self.config.features_refresh_rate(),
                shutdown.clone(),
                move || {
                    let splits = splits.clone();
                    let queue = queue.clone();
                    let registry = registry.clone();
                    let gates = gates.clone();
                    let segments_task = segments_task.clone();
                    async move {
                        match splits.synchronize(&FetchOptions::default()).await {
                            Ok(referenced) => {
                                for name in registry.register(referenced) {
                                    queue.enqueue(name);
                                }
                                if gates.mark_ready(Resource::Flags) {
                                    segments_task.trigger();
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "flag synchronization failed"),
                        }
                    }
                },
            )
        };

        let cadence = Cadence {
            flags: flags_task,
            segments: segments_task,
            fast: PollingIntervals {
                flags: self.config.features_refresh_rate(),
                segments: self.config.segments_refresh_rate(),
            },
            safety: self.config.safety_refresh_rate(),
        };

        let mut tasks = vec![flags_join, segments_join];

        if self.config.streaming_enabled {
            let (split_queue, split_worker) = start_split_worker(
                splits.clone(),
                self.registry.clone(),
                segment_queue.clone(),
                shutdown.clone(),
            );
            let dispatcher = UpdateDispatcher::new(
                splits,
                self.caches.clone(),
                self.registry.clone(),
                split_queue,
                segment_queue,
            );
            let push = PushManager::new(
                self.backends.auth.clone(),
                self.backends.connector.clone(),
                dispatcher,
                self.publisher.clone(),
                self.config.streaming.clone(),
            );

            tasks.push(split_worker);
            tasks.push(tokio::spawn(follow_status(
                self.publisher.watch(),
                cadence.clone(),
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(push.run(shutdown)));
        } else {
            tracing::info!("streaming disabled, polling only");
        }

        tracing::info!(
            segment_workers = pool.size(),
            streaming = self.config.streaming_enabled,
            "synchronization started"
        );
        *running = Some(Running {
            shutdown: shutdown_tx,
            cadence,
            tasks,
            pool,
        });
        Ok(())
    }

    /// `None` when not running.
    pub fn polling_intervals(&self) -> Option<PollingIntervals> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.cadence.intervals())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stops every task and freezes the caches.
    ///
    /// Caches are frozen first so a fetch completing during shutdown cannot
    /// write into them. Pending segment jobs are discarded.
    pub async fn stop(&self) {
        self.caches.freeze();

        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.send_replace(true);

        for mut task in running.tasks {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(Err(e)) if !e.is_cancelled() => tracing::error!("Sync task panicked: {}", e),
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("sync task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        if tokio::time::timeout(STOP_TIMEOUT, running.pool.join())
            .await
            .is_err()
        {
            tracing::warn!("segment workers did not stop in time");
        }
        tracing::info!("synchronization stopped");
    }
}

async fn follow_status(
    mut status: watch::Receiver<Option<StreamingStatus>>,
    cadence: Cadence,
    mut shutdown: super::Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = *status.borrow_and_update();
        if let Some(current) = current {
            cadence.apply(current);
        }
    }
}
