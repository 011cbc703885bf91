use super::Shutdown;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// Control handle for a running periodic task.
///
/// The interval can be changed while the task runs; the new value applies to the
/// wait that is in progress. `trigger` runs the task body now instead of waiting.
#[derive(Clone)]
pub struct TaskHandle {
    name: &'static str,
    interval: Arc<watch::Sender<Duration>>,
    trigger: Arc<Notify>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval.send_if_modified(|current| {
            if *current == interval {
                return false;
            }
            tracing::debug!(task = self.name, ?interval, "polling interval changed");
            *current = interval;
            true
        });
    }

    pub fn trigger(&self) {
        self.trigger.notify_one();
    }
}

/// Runs `tick` immediately and then every interval until shutdown.
///
/// A failing tick never stops the loop: `tick` is expected to log its own errors.
/// An in-flight tick is dropped when shutdown is signalled.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: Shutdown,
    mut tick: F,
) -> (TaskHandle, JoinHandle<()>)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (interval_tx, mut interval_rx) = watch::channel(interval);
    let handle = TaskHandle {
        name,
        interval: Arc::new(interval_tx),
        trigger: Arc::new(Notify::new()),
    };

    let trigger = handle.trigger.clone();
    // Held by the task so dropping every handle does not close the channel
    let interval_tx = handle.interval.clone();
    let join = tokio::spawn(async move {
        let _interval_tx = interval_tx;
        tracing::debug!(task = name, "periodic task started");
        'run: loop {
            tokio::select! {
                _ = shutdown.wait() => break 'run,
                _ = tick() => {}
            }

            // Wait for the next tick. An interval change restarts the wait.
            loop {
                let wait = *interval_rx.borrow_and_update();
                tokio::select! {
                    _ = shutdown.wait() => break 'run,
                    _ = tokio::time::sleep(wait) => break,
                    _ = trigger.notified() => break,
                    _ = interval_rx.changed() => {}
                }
            }
        }
        tracing::debug!(task = name, "periodic task stopped");
    });

    (handle, join)
}
