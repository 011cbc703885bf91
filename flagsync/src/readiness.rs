//! One-way readiness latches for the rule caches.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Flags,
    Segments,
}

impl Resource {
    const fn bit(self) -> u8 {
        match self {
            Resource::Flags => 0b01,
            Resource::Segments => 0b10,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Resource::Flags => "flags",
            Resource::Segments => "segments",
        }
    }
}

const ALL: u8 = Resource::Flags.bit() | Resource::Segments.bit();

/// Tracks which caches completed their first synchronization.
///
/// Gates only ever move from not-ready to ready. Blocking waiters are woken
/// through a condvar and async waiters through a watch channel.
pub struct ReadinessGates {
    state: Mutex<u8>,
    cond: Condvar,
    watch: watch::Sender<u8>,
}

impl Default for ReadinessGates {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGates {
    pub fn new() -> Self {
        let (watch, _) = watch::channel(0);
        ReadinessGates {
            state: Mutex::new(0),
            cond: Condvar::new(),
            watch,
        }
    }

    /// Opens the gate for `resource`. Returns true for the call that opened it.
    pub fn mark_ready(&self, resource: Resource) -> bool {
        let mut state = self.state.lock();
        if *state & resource.bit() != 0 {
            return false;
        }
        *state |= resource.bit();
        let snapshot = *state;
        drop(state);

        tracing::info!(resource = resource.as_str(), "cache ready");
        self.watch.send_replace(snapshot);
        self.cond.notify_all();
        true
    }

    pub fn is_ready(&self, resource: Resource) -> bool {
        *self.state.lock() & resource.bit() != 0
    }

    /// Both flags and segments are ready.
    pub fn is_all_ready(&self) -> bool {
        *self.state.lock() == ALL
    }

    /// Blocks the calling thread until every gate is open or `timeout` elapses.
    ///
    /// Do not call this from an async context; use [`ReadinessGates::ready`] there.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if *state == ALL {
            return true;
        }
        self.cond
            .wait_while_for(&mut state, |s| *s != ALL, timeout);
        *state == ALL
    }

    /// Async counterpart of [`ReadinessGates::wait_until_ready`].
    pub async fn ready(&self, timeout: Duration) -> bool {
        let mut rx = self.watch.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ALL)).await,
            Ok(Ok(_))
        )
    }
}
