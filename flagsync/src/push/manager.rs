use super::client::{ConnectionOutcome, StreamConnector, StreamEvent};
use super::notification::{Notification, RuleUpdate};
use super::status::{StatusKeeper, StreamingStatus};
use crate::api::{AuthApi, AuthToken};
use crate::backoff::Backoff;
use crate::cache::Caches;
use crate::config::StreamingConfig;
use crate::error::SyncError;
use crate::metrics_defs::{
    STREAMING_AUTH_REJECTIONS, STREAMING_NOTIFICATIONS, STREAMING_STATUS,
    STREAMING_TOKEN_REFRESHES,
};
use crate::sync::{
    FetchTarget, PushOutcome, SegmentQueue, SegmentRegistry, Shutdown, SplitQueue, SplitUpdater,
    shutdown_channel,
};
use crate::types::{ChangeNumber, RuleBasedSegment, Split};
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Publishes streaming status transitions.
///
/// Subscribers of [`StatusPublisher::subscribe`] see every transition in order.
/// [`StatusPublisher::watch`] only tracks the latest one.
#[derive(Clone)]
pub struct StatusPublisher {
    transitions: broadcast::Sender<StreamingStatus>,
    current: Arc<watch::Sender<Option<StreamingStatus>>>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (current, _) = watch::channel(None);
        StatusPublisher {
            transitions,
            current: Arc::new(current),
        }
    }

    /// Publishes `status` unless it repeats the current one.
    pub fn publish(&self, status: StreamingStatus) {
        let changed = self.current.send_if_modified(|current| {
            if *current == Some(status) {
                return false;
            }
            *current = Some(status);
            true
        });
        if !changed {
            return;
        }

        counter!(STREAMING_STATUS, "status" => status.as_str()).increment(1);
        tracing::info!(%status, "streaming status changed");
        let _ = self.transitions.send(status);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamingStatus> {
        self.transitions.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<Option<StreamingStatus>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<StreamingStatus> {
        *self.current.borrow()
    }
}

/// Turns update notifications into cache writes or queued fetches.
#[derive(Clone)]
pub struct UpdateDispatcher {
    splits: Arc<SplitUpdater>,
    caches: Caches,
    registry: Arc<SegmentRegistry>,
    split_queue: SplitQueue,
    segment_queue: SegmentQueue,
}

impl UpdateDispatcher {
    pub fn new(
        splits: Arc<SplitUpdater>,
        caches: Caches,
        registry: Arc<SegmentRegistry>,
        split_queue: SplitQueue,
        segment_queue: SegmentQueue,
    ) -> Self {
        UpdateDispatcher {
            splits,
            caches,
            registry,
            split_queue,
            segment_queue,
        }
    }

    pub fn dispatch(&self, notification: Notification) {
        match notification {
            Notification::SplitUpdate(update) => self.on_split_update(update),
            Notification::RuleBasedSegmentUpdate(update) => {
                self.on_rule_based_segment_update(update)
            }
            Notification::SplitKill {
                change_number,
                split_name,
                default_treatment,
            } => self.on_kill(&split_name, &default_treatment, change_number),
            Notification::SegmentUpdate {
                change_number,
                segment_name,
            } => self.on_segment_update(segment_name, change_number),
            Notification::Control { .. }
            | Notification::Occupancy { .. }
            | Notification::Error(_) => {}
        }
    }

    fn on_split_update(&self, update: RuleUpdate<Split>) {
        let outcome = match update.definition {
            Some(split) => {
                self.splits
                    .apply_pushed_split(split, update.previous_change_number)
            }
            None => Ok(PushOutcome::NeedsFetch),
        };
        self.settle(outcome, FetchTarget::flags(update.change_number));
    }

    fn on_rule_based_segment_update(&self, update: RuleUpdate<RuleBasedSegment>) {
        let outcome = match update.definition {
            Some(segment) => {
                self.splits
                    .apply_pushed_rule_based_segment(segment, update.previous_change_number)
            }
            None => Ok(PushOutcome::NeedsFetch),
        };
        self.settle(
            outcome,
            FetchTarget::rule_based_segments(update.change_number),
        );
    }

    fn settle(&self, outcome: Result<PushOutcome, SyncError>, target: FetchTarget) {
        match outcome {
            Ok(PushOutcome::Applied {
                referenced_segments,
            }) => self.track_segments(referenced_segments),
            Ok(PushOutcome::Stale) => {
                tracing::debug!(?target, "ignoring update older than the cache");
            }
            Ok(PushOutcome::NeedsFetch) => self.fetch(target),
            Err(e) => {
                tracing::warn!(error = %e, ?target, "could not apply pushed update");
                self.fetch(target);
            }
        }
    }

    fn fetch(&self, target: FetchTarget) {
        if self.splits.reached(&target) {
            return;
        }
        if !self.split_queue.enqueue(target) {
            tracing::debug!(?target, "flag fetch worker is gone, dropping update");
        }
    }

    fn track_segments(&self, names: impl IntoIterator<Item = String>) {
        for name in self.registry.register(names) {
            self.segment_queue.enqueue(name);
        }
    }

    fn on_kill(&self, name: &str, default_treatment: &str, change_number: ChangeNumber) {
        match self
            .caches
            .splits
            .kill_locally(name, default_treatment, change_number)
        {
            Ok(true) => tracing::info!(flag = name, change_number, "flag killed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(flag = name, error = %e, "could not kill flag"),
        }
        self.fetch(FetchTarget::flags(change_number));
    }

    fn on_segment_update(&self, name: String, change_number: ChangeNumber) {
        if self.caches.segments.change_number(&name) >= change_number {
            return;
        }
        self.registry.register([name.clone()]);
        self.segment_queue.enqueue_with_target(name, change_number);
    }
}

enum SessionEnd {
    Shutdown,
    TokenRefresh,
    Disabled,
    Closed(ConnectionOutcome),
}

/// Owns the push lifecycle: authentication, connection, reconnect backoff and
/// token refresh. Feeds every notification to the [`StatusKeeper`] or the
/// [`UpdateDispatcher`].
pub struct PushManager {
    auth: Arc<dyn AuthApi>,
    connector: Arc<dyn StreamConnector>,
    dispatcher: UpdateDispatcher,
    publisher: StatusPublisher,
    config: StreamingConfig,
    keeper: StatusKeeper,
}

impl PushManager {
    pub fn new(
        auth: Arc<dyn AuthApi>,
        connector: Arc<dyn StreamConnector>,
        dispatcher: UpdateDispatcher,
        publisher: StatusPublisher,
        config: StreamingConfig,
    ) -> Self {
        PushManager {
            auth,
            connector,
            dispatcher,
            publisher,
            config,
            keeper: StatusKeeper::new(),
        }
    }

    /// Runs until shutdown or until push is turned off for good.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );

        while !shutdown.is_triggered() && !self.keeper.is_off() {
            let result = tokio::select! {
                _ = shutdown.wait() => break,
                result = self.auth.authenticate() => result,
            };

            let token = match result.map_err(SyncError::from) {
                Ok(token) if !token.push_enabled => {
                    tracing::info!("push is disabled for this key, polling only");
                    self.publish_error(false);
                    break;
                }
                Ok(token) => token,
                Err(SyncError::AuthRejected(reason)) => {
                    counter!(STREAMING_AUTH_REJECTIONS).increment(1);
                    tracing::error!(%reason, "streaming authentication rejected");
                    self.publish_error(false);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "streaming authentication failed");
                    self.publish_error(true);
                    if !sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if let Some(delay) = token.connect_delay
                && !delay.is_zero()
            {
                tracing::debug!(?delay, "delaying streaming connection");
                if !sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }

            match self.stream(&token, &mut shutdown, &mut backoff).await {
                SessionEnd::Shutdown | SessionEnd::Disabled => break,
                SessionEnd::Closed(ConnectionOutcome::Cancelled) => break,
                SessionEnd::TokenRefresh => {
                    counter!(STREAMING_TOKEN_REFRESHES).increment(1);
                    tracing::info!("refreshing streaming token");
                }
                SessionEnd::Closed(ConnectionOutcome::Retryable(reason)) => {
                    tracing::warn!(%reason, "streaming connection lost");
                    self.publish_error(true);
                    if !sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                        break;
                    }
                }
                SessionEnd::Closed(ConnectionOutcome::NonRetryable(reason)) => {
                    tracing::error!(%reason, "streaming failed permanently, polling only");
                    self.publish_error(false);
                    break;
                }
            }
        }
        tracing::debug!("push manager stopped");
    }

    async fn stream(
        &mut self,
        token: &AuthToken,
        shutdown: &mut Shutdown,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let (stop_tx, stop) = shutdown_channel();
        let (events_tx, mut events) = mpsc::channel(self.config.notification_buffer);

        let connector = self.connector.clone();
        let connection_token = token.clone();
        let connection = tokio::spawn(async move {
            connector.connect(&connection_token, events_tx, stop).await
        });

        let refresh_in = token.refresh_in();
        let refresh = async move {
            match refresh_in {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(refresh);

        let end = loop {
            tokio::select! {
                _ = shutdown.wait() => break SessionEnd::Shutdown,
                _ = &mut refresh => break SessionEnd::TokenRefresh,
                event = events.recv() => match event {
                    Some(StreamEvent::Connected) => {
                        backoff.reset();
                        let transitions = self.keeper.on_connected();
                        self.publish(transitions);
                    }
                    Some(StreamEvent::Notification(notification)) => {
                        self.handle(notification);
                        if self.keeper.is_off() {
                            break SessionEnd::Disabled;
                        }
                    }
                    // The connection task returned and dropped its sender
                    None => break SessionEnd::Closed(ConnectionOutcome::Cancelled),
                },
            }
        };

        stop_tx.send_replace(true);
        let outcome = match connection.await {
            Ok(outcome) => outcome,
            Err(e) => ConnectionOutcome::Retryable(format!("connection task failed: {e}")),
        };

        match end {
            SessionEnd::Closed(_) => SessionEnd::Closed(outcome),
            other => other,
        }
    }

    fn handle(&mut self, notification: Notification) {
        counter!(STREAMING_NOTIFICATIONS, "type" => notification.kind()).increment(1);

        match notification {
            Notification::Control { control_type, .. } => {
                let transitions = self.keeper.on_control(control_type);
                self.publish(transitions);
            }
            Notification::Occupancy {
                channel,
                publishers,
                timestamp,
            } => {
                let transitions = self.keeper.on_occupancy(&channel, publishers, timestamp);
                self.publish(transitions);
            }
            Notification::Error(error) => {
                tracing::warn!(
                    code = error.code,
                    status_code = error.status_code,
                    message = %error.message,
                    "push service reported an error"
                );
            }
            update => self.dispatcher.dispatch(update),
        }
    }

    fn publish_error(&mut self, retryable: bool) {
        let transitions = self.keeper.on_error(retryable);
        self.publish(transitions);
    }

    fn publish(&self, transitions: Vec<StreamingStatus>) {
        for status in transitions {
            self.publisher.publish(status);
        }
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
