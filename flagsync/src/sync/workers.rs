use super::{FetchTarget, SegmentRegistry, SegmentUpdater, Shutdown, SplitUpdater};
use crate::api::FetchOptions;
use crate::error::SyncError;
use crate::types::ChangeNumber;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

/// A request to bring one segment up to date.
#[derive(Debug)]
pub struct SegmentJob {
    pub name: String,
    /// Change number announced by push, if any.
    pub till: Option<ChangeNumber>,
    /// Receives the outcome once a worker finished the job.
    pub done: Option<oneshot::Sender<Result<(), SyncError>>>,
}

/// Producer side of the segment FIFO shared by every worker.
#[derive(Clone)]
pub struct SegmentQueue {
    tx: mpsc::UnboundedSender<SegmentJob>,
}

impl SegmentQueue {
    /// Queues `name`. Returns false once the pool has shut down.
    pub fn enqueue(&self, name: impl Into<String>) -> bool {
        self.send(SegmentJob {
            name: name.into(),
            till: None,
            done: None,
        })
    }

    /// Queues `name` with the change number a push notification announced.
    pub fn enqueue_with_target(&self, name: impl Into<String>, till: ChangeNumber) -> bool {
        self.send(SegmentJob {
            name: name.into(),
            till: Some(till),
            done: None,
        })
    }

    /// Queues `name` and returns a receiver resolved when a worker processed it.
    ///
    /// The receiver errors if the job is discarded by a shutdown.
    pub fn enqueue_and_wait(
        &self,
        name: impl Into<String>,
    ) -> oneshot::Receiver<Result<(), SyncError>> {
        let (done, rx) = oneshot::channel();
        self.send(SegmentJob {
            name: name.into(),
            till: None,
            done: Some(done),
        });
        rx
    }

    fn send(&self, job: SegmentJob) -> bool {
        self.tx.send(job).is_ok()
    }
}

/// Fixed-size pool of workers draining the segment queue.
///
/// The pool size bounds the number of concurrent segment requests. Enqueuing the
/// same name twice is harmless: the second job finds the segment current after a
/// single request.
pub struct SegmentWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl SegmentWorkerPool {
    pub fn start(
        size: usize,
        updater: Arc<SegmentUpdater>,
        shutdown: Shutdown,
    ) -> (SegmentQueue, SegmentWorkerPool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let updater = updater.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_segment_worker(worker, rx, updater, shutdown))
            })
            .collect();

        (SegmentQueue { tx }, SegmentWorkerPool { handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit after shutdown was signalled.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::error!("Segment worker panicked: {}", e);
            }
        }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn run_segment_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<SegmentJob>>>,
    updater: Arc<SegmentUpdater>,
    mut shutdown: Shutdown,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.wait() => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };

        let result = tokio::select! {
            _ = shutdown.wait() => Err(SyncError::Cancelled),
            result = process(&updater, &job) => result,
        };

        if let Err(e) = &result
            && *e != SyncError::Cancelled
        {
            tracing::warn!(worker, segment = %job.name, error = %e, "segment synchronization failed");
        }
        if let Some(done) = job.done {
            let _ = done.send(result);
        }
    }
    tracing::debug!(worker, "segment worker stopped");
}

async fn process(updater: &SegmentUpdater, job: &SegmentJob) -> Result<(), SyncError> {
    match job.till {
        Some(till) => {
            updater
                .synchronize_segment_with_target(&job.name, till)
                .await
        }
        None => {
            updater
                .synchronize_segment(&job.name, &FetchOptions::default())
                .await
        }
    }
}

/// Queues every registered segment and waits for all of them.
///
/// Succeeds only if every segment was synchronized.
pub async fn sweep_segments(queue: &SegmentQueue, registry: &SegmentRegistry) -> Result<(), SyncError> {
    let pending: Vec<_> = registry
        .names()
        .into_iter()
        .map(|name| queue.enqueue_and_wait(name))
        .collect();

    let mut first_error = None;
    for rx in pending {
        let result = rx.await.unwrap_or(Err(SyncError::Cancelled));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Producer side of push-triggered flag fetches.
#[derive(Clone)]
pub struct SplitQueue {
    tx: mpsc::UnboundedSender<FetchTarget>,
}

impl SplitQueue {
    pub fn enqueue(&self, target: FetchTarget) -> bool {
        self.tx.send(target).is_ok()
    }
}

/// Starts the single worker that serves push-triggered flag fetches.
///
/// Targets queued while a fetch is in flight are merged into one. Segments that
/// show up in fetched flags are registered and queued for the segment pool.
pub fn start_split_worker(
    updater: Arc<SplitUpdater>,
    registry: Arc<SegmentRegistry>,
    segments: SegmentQueue,
    mut shutdown: Shutdown,
) -> (SplitQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<FetchTarget>();

    let handle = tokio::spawn(async move {
        loop {
            let target = tokio::select! {
                _ = shutdown.wait() => break,
                target = rx.recv() => target,
            };
            let Some(mut target) = target else {
                break;
            };
            while let Ok(next) = rx.try_recv() {
                target = target.merge(next);
            }

            let result = tokio::select! {
                _ = shutdown.wait() => break,
                result = updater.synchronize_with_target(target) => result,
            };

            match result {
                Ok(referenced) => {
                    for name in registry.register(referenced) {
                        segments.enqueue(name);
                    }
                }
                Err(e) => tracing::warn!(error = %e, ?target, "push-triggered flag fetch failed"),
            }
        }
        tracing::debug!("flag fetch worker stopped");
    });

    (SplitQueue { tx }, handle)
}
