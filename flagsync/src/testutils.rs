//! In-memory stand-ins for the backend, used across the crate's tests.

use crate::api::{AuthApi, AuthToken, ChangesApi, FetchError, FetchOptions};
use crate::push::{ConnectionOutcome, StreamConnector, StreamEvent};
use crate::sync::Shutdown;
use crate::types::{
    ChangeNumber, RuleBasedSegment, RuleChanges, RuleChangesPage, RuleEntity, SegmentChanges,
    Split,
};
use async_trait::async_trait;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct RuleRequest {
    pub since: ChangeNumber,
    pub rb_since: ChangeNumber,
    pub options: FetchOptions,
}

#[derive(Clone, Debug)]
pub struct SegmentRequest {
    pub name: String,
    pub since: ChangeNumber,
    pub options: FetchOptions,
}

struct SegmentChange {
    change_number: ChangeNumber,
    added: Vec<String>,
    removed: Vec<String>,
}

#[derive(Default)]
struct BackendState {
    splits: Vec<Split>,
    rule_based_segments: Vec<RuleBasedSegment>,
    segments: HashMap<String, Vec<SegmentChange>>,
    fail_rules: Option<u16>,
    fail_segment: Option<u16>,
    stale_until_bypass: bool,
    delay: Option<Duration>,
    rule_requests: Vec<RuleRequest>,
    segment_requests: Vec<SegmentRequest>,
}

/// Stateful fake of the polling endpoints.
///
/// Every pushed entity version is kept. A request returns the latest version of
/// each entity newer than `since`, with `till` the highest change number seen.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_split(&self, split: Split) {
        self.state.lock().splits.push(split);
    }

    pub fn push_rule_based_segment(&self, segment: RuleBasedSegment) {
        self.state.lock().rule_based_segments.push(segment);
    }

    pub fn push_segment_change(
        &self,
        name: &str,
        change_number: ChangeNumber,
        added: &[&str],
        removed: &[&str],
    ) {
        self.state
            .lock()
            .segments
            .entry(name.to_string())
            .or_default()
            .push(SegmentChange {
                change_number,
                added: added.iter().map(|k| k.to_string()).collect(),
                removed: removed.iter().map(|k| k.to_string()).collect(),
            });
    }

    /// The next `/splitChanges` request fails with `status`.
    pub fn fail_next_rules(&self, status: u16) {
        self.state.lock().fail_rules = Some(status);
    }

    /// The next `/segmentChanges` request fails with `status`.
    pub fn fail_next_segment(&self, status: u16) {
        self.state.lock().fail_segment = Some(status);
    }

    /// Behave like a CDN that keeps serving an empty delta unless `till` is sent.
    pub fn serve_stale_until_bypass(&self, stale: bool) {
        self.state.lock().stale_until_bypass = stale;
    }

    pub fn delay_responses(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn rule_requests(&self) -> Vec<RuleRequest> {
        self.state.lock().rule_requests.clone()
    }

    pub fn segment_requests(&self) -> Vec<SegmentRequest> {
        self.state.lock().segment_requests.clone()
    }

    pub fn clear_requests(&self) {
        let mut state = self.state.lock();
        state.rule_requests.clear();
        state.segment_requests.clear();
    }

    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn status_error(status: u16) -> FetchError {
    FetchError::Status {
        status,
        retryable: status >= 500 || status == 408 || status == 429,
    }
}

fn page<T: RuleEntity>(versions: &[T], since: ChangeNumber, stale: bool) -> RuleChangesPage<T> {
    if stale {
        return RuleChangesPage {
            since,
            till: since,
            data: Vec::new(),
        };
    }

    let mut latest: BTreeMap<&str, &T> = BTreeMap::new();
    for entity in versions.iter().filter(|e| e.change_number() > since) {
        let newer = latest
            .get(entity.name())
            .is_none_or(|current| current.change_number() < entity.change_number());
        if newer {
            latest.insert(entity.name(), entity);
        }
    }

    let till = latest
        .values()
        .map(|e| e.change_number())
        .max()
        .unwrap_or(since)
        .max(since);
    RuleChangesPage {
        since,
        till,
        data: latest.into_values().cloned().collect(),
    }
}

#[async_trait]
impl ChangesApi for FakeBackend {
    async fn fetch_rules(
        &self,
        since: ChangeNumber,
        rb_since: ChangeNumber,
        options: &FetchOptions,
    ) -> Result<RuleChanges, FetchError> {
        {
            let mut state = self.state.lock();
            state.rule_requests.push(RuleRequest {
                since,
                rb_since,
                options: options.clone(),
            });
            if let Some(status) = state.fail_rules.take() {
                return Err(status_error(status));
            }
        }
        self.pause().await;

        let state = self.state.lock();
        let stale = state.stale_until_bypass && options.till.is_none();
        Ok(RuleChanges {
            ff: page(&state.splits, since, stale),
            rbs: page(&state.rule_based_segments, rb_since, stale),
        })
    }

    async fn fetch_segment(
        &self,
        name: &str,
        since: ChangeNumber,
        options: &FetchOptions,
    ) -> Result<SegmentChanges, FetchError> {
        {
            let mut state = self.state.lock();
            state.segment_requests.push(SegmentRequest {
                name: name.to_string(),
                since,
                options: options.clone(),
            });
            if let Some(status) = state.fail_segment.take() {
                return Err(status_error(status));
            }
        }
        self.pause().await;

        let state = self.state.lock();
        let mut response = SegmentChanges {
            name: name.to_string(),
            since,
            till: since,
            added: Vec::new(),
            removed: Vec::new(),
        };
        if state.stale_until_bypass && options.till.is_none() {
            return Ok(response);
        }

        let mut added = IndexSet::new();
        let mut removed = IndexSet::new();
        for change in state
            .segments
            .get(name)
            .into_iter()
            .flatten()
            .filter(|c| c.change_number > since)
        {
            for key in &change.added {
                removed.shift_remove(key);
                added.insert(key.clone());
            }
            for key in &change.removed {
                added.shift_remove(key);
                removed.insert(key.clone());
            }
            response.till = response.till.max(change.change_number);
        }
        response.added = added.into_iter().collect();
        response.removed = removed.into_iter().collect();
        Ok(response)
    }
}

/// Scripted auth endpoint. Once the script runs out it keeps issuing a
/// push-enabled token without expiry.
#[derive(Default)]
pub struct FakeAuth {
    replies: Mutex<VecDeque<Result<AuthToken, u16>>>,
    calls: Mutex<usize>,
}

impl FakeAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_token(&self, token: AuthToken) {
        self.replies.lock().push_back(Ok(token));
    }

    pub fn push_status(&self, status: u16) {
        self.replies.lock().push_back(Err(status));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn authenticate(&self) -> Result<AuthToken, FetchError> {
        *self.calls.lock() += 1;
        match self.replies.lock().pop_front() {
            Some(Ok(token)) => Ok(token),
            Some(Err(status)) => Err(status_error(status)),
            None => Ok(AuthToken {
                push_enabled: true,
                token: "tok".into(),
                channels: vec!["xxxx_splits".into()],
                issued_at: None,
                expires_at: None,
                connect_delay: None,
            }),
        }
    }
}

enum Session {
    Scripted {
        events: Vec<StreamEvent>,
        end: ConnectionOutcome,
    },
    Live(mpsc::UnboundedReceiver<StreamEvent>),
}

/// Scripted push connections, consumed one per `connect` call.
///
/// A scripted session sends its events and ends with the given outcome. A live
/// session forwards whatever the test sends until shutdown, or ends as retryable
/// when the test drops its sender. With no session left, connections stay idle
/// until shutdown.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<VecDeque<Session>>,
    tokens: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_session(&self, events: Vec<StreamEvent>, end: ConnectionOutcome) {
        self.sessions
            .lock()
            .push_back(Session::Scripted { events, end });
    }

    pub fn open_session(&self) -> mpsc::UnboundedSender<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().push_back(Session::Live(rx));
        tx
    }

    /// Tokens of every connection attempt, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(
        &self,
        token: &AuthToken,
        events: mpsc::Sender<StreamEvent>,
        mut shutdown: Shutdown,
    ) -> ConnectionOutcome {
        self.tokens.lock().push(token.token.clone());
        let session = self.sessions.lock().pop_front();

        match session {
            None => {
                shutdown.wait().await;
                ConnectionOutcome::Cancelled
            }
            Some(Session::Scripted { events: script, end }) => {
                for event in script {
                    if events.send(event).await.is_err() {
                        return ConnectionOutcome::Cancelled;
                    }
                }
                end
            }
            Some(Session::Live(mut rx)) => loop {
                let event = tokio::select! {
                    _ = shutdown.wait() => return ConnectionOutcome::Cancelled,
                    event = rx.recv() => event,
                };
                let Some(event) = event else {
                    return ConnectionOutcome::Retryable("session closed".into());
                };
                if events.send(event).await.is_err() {
                    return ConnectionOutcome::Cancelled;
                }
            },
        }
    }
}
