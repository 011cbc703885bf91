use crate::api::{BuildError, HttpApi};
use crate::cache::Caches;
use crate::config::{Config, ValidationError};
use crate::evaluation::{Evaluator, RuleView};
use crate::push::{StatusPublisher, StreamingClient, StreamingStatus};
use crate::readiness::ReadinessGates;
use crate::sync::{Backends, PollingIntervals, SyncManager};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("could not set up HTTP clients: {0}")]
    Build(#[from] BuildError),

    #[error("the client was destroyed")]
    Destroyed,
}

struct ClientInner {
    manager: SyncManager,
    caches: Caches,
    gates: Arc<ReadinessGates>,
    publisher: StatusPublisher,
    destroyed: Arc<AtomicBool>,
}

/// Entry point of the engine: owns the caches of one SDK key and keeps them in
/// sync until destroyed.
///
/// Clones share the same caches and background tasks. Independent instances
/// never share state.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Client talking to the endpoints in `config`.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        let api = Arc::new(HttpApi::new(&config)?);
        let connector = Arc::new(StreamingClient::new(&config)?);

        Self::with_backends(
            config,
            Backends {
                changes: api.clone(),
                auth: api,
                connector,
            },
        )
    }

    pub fn with_backends(config: Config, backends: Backends) -> Result<Self, ClientError> {
        let caches = Caches::new();
        let gates = Arc::new(ReadinessGates::new());
        let publisher = StatusPublisher::new();
        let manager = SyncManager::new(
            config,
            backends,
            caches.clone(),
            gates.clone(),
            publisher.clone(),
        )?;

        Ok(SyncClient {
            inner: Arc::new(ClientInner {
                manager,
                caches,
                gates,
                publisher,
                destroyed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    /// Starts background synchronization. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), ClientError> {
        if self.is_destroyed() {
            return Err(ClientError::Destroyed);
        }
        self.inner.manager.start()?;
        Ok(())
    }

    /// Blocks the calling thread until flags and segments are ready, or `timeout`
    /// elapses. Returns false on timeout; synchronization carries on regardless.
    pub fn block_until_ready(&self, timeout: Duration) -> bool {
        self.inner.gates.wait_until_ready(timeout)
    }

    pub async fn ready(&self, timeout: Duration) -> bool {
        self.inner.gates.ready(timeout).await
    }

    pub fn is_ready(&self) -> bool {
        !self.is_destroyed() && self.inner.gates.is_all_ready()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Read access for evaluation.
    pub fn rules(&self) -> RuleView {
        RuleView::new(
            self.inner.caches.clone(),
            self.inner.gates.clone(),
            self.inner.destroyed.clone(),
        )
    }

    pub fn treatment(&self, flag: &str, key: &str, evaluator: &dyn Evaluator) -> String {
        self.rules().treatment(flag, key, evaluator)
    }

    pub fn caches(&self) -> &Caches {
        &self.inner.caches
    }

    /// Every streaming status transition from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamingStatus> {
        self.inner.publisher.subscribe()
    }

    /// `None` until push reported anything, and always with streaming disabled.
    pub fn streaming_status(&self) -> Option<StreamingStatus> {
        self.inner.publisher.current()
    }

    pub fn polling_intervals(&self) -> Option<PollingIntervals> {
        self.inner.manager.polling_intervals()
    }

    /// Stops synchronization and freezes the caches. Evaluations return control
    /// from now on.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.manager.stop().await;
    }
}
