//! Polling side of the engine: updaters, periodic tasks, the segment worker pool
//! and the orchestrator that arbitrates between polling and push.

mod manager;
mod segment;
mod split;
mod task;
mod workers;

pub use manager::{Backends, PollingIntervals, SyncManager};
pub use segment::{SegmentRegistry, SegmentUpdater};
pub use split::{FetchTarget, PushOutcome, SplitUpdater};
pub use task::{TaskHandle, spawn_periodic};
pub use workers::{
    SegmentJob, SegmentQueue, SegmentWorkerPool, SplitQueue, start_split_worker, sweep_segments,
};

use tokio::sync::watch;

/// Receiving side of the engine-wide stop signal.
#[derive(Clone, Debug)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is signalled or the sender is gone.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

pub fn shutdown_channel() -> (watch::Sender<bool>, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (tx, Shutdown(rx))
}
