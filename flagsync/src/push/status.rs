use super::notification::ControlType;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum StreamingStatus {
    /// Push is connected and publishers are present.
    #[serde(rename = "STREAMING_READY")]
    Ready,
    /// Connected, but no publishers or paused by the backend. Polling takes over.
    #[serde(rename = "STREAMING_PAUSED")]
    Paused,
    /// Publishers came back. Always followed by `Ready`.
    #[serde(rename = "STREAMING_RESUMED")]
    Resumed,
    /// Transient failure, a reconnect is scheduled.
    #[serde(rename = "STREAMING_BACKOFF")]
    Backoff,
    /// Push is off for the rest of the client's life.
    #[serde(rename = "STREAMING_OFF")]
    Off,
}

impl StreamingStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamingStatus::Ready => "STREAMING_READY",
            StreamingStatus::Paused => "STREAMING_PAUSED",
            StreamingStatus::Resumed => "STREAMING_RESUMED",
            StreamingStatus::Backoff => "STREAMING_BACKOFF",
            StreamingStatus::Off => "STREAMING_OFF",
        }
    }

    /// Whether polling can relax to the safety interval.
    pub fn is_push_healthy(&self) -> bool {
        matches!(self, StreamingStatus::Ready | StreamingStatus::Resumed)
    }
}

impl fmt::Display for StreamingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug)]
struct Occupancy {
    publishers: u32,
    timestamp: i64,
}

/// Occupancy and control state machine.
///
/// Every input returns the transitions it caused, in order, so the caller decides
/// how to publish them. Once `Off` is reached every further input is ignored.
#[derive(Debug, Default)]
pub struct StatusKeeper {
    occupancy: HashMap<String, Occupancy>,
    publishers_available: bool,
    paused_by_control: bool,
    current: Option<StreamingStatus>,
}

impl StatusKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<StreamingStatus> {
        self.current
    }

    pub fn is_off(&self) -> bool {
        self.current == Some(StreamingStatus::Off)
    }

    /// A new connection was accepted. Occupancy is unknown until the backend
    /// reports it, so publishers are assumed present.
    pub fn on_connected(&mut self) -> Vec<StreamingStatus> {
        if self.is_off() {
            return Vec::new();
        }
        self.occupancy.clear();
        self.publishers_available = true;
        self.paused_by_control = false;
        self.transition(&[StreamingStatus::Ready])
    }

    pub fn on_occupancy(
        &mut self,
        channel: &str,
        publishers: u32,
        timestamp: i64,
    ) -> Vec<StreamingStatus> {
        if self.is_off() {
            return Vec::new();
        }
        if let Some(previous) = self.occupancy.get(channel)
            && previous.timestamp > timestamp
        {
            tracing::debug!(channel, timestamp, "ignoring out-of-order occupancy");
            return Vec::new();
        }
        self.occupancy.insert(
            channel.to_string(),
            Occupancy {
                publishers,
                timestamp,
            },
        );

        let available = self.occupancy.values().any(|o| o.publishers > 0);
        if available == self.publishers_available {
            return Vec::new();
        }
        self.publishers_available = available;

        if self.paused_by_control {
            return Vec::new();
        }
        if available {
            self.transition(&[StreamingStatus::Resumed, StreamingStatus::Ready])
        } else {
            self.transition(&[StreamingStatus::Paused])
        }
    }

    pub fn on_control(&mut self, control: ControlType) -> Vec<StreamingStatus> {
        if self.is_off() {
            return Vec::new();
        }
        match control {
            ControlType::StreamingPaused if !self.paused_by_control => {
                self.paused_by_control = true;
                if self.publishers_available {
                    return self.transition(&[StreamingStatus::Paused]);
                }
                Vec::new()
            }
            ControlType::StreamingResumed if self.paused_by_control => {
                self.paused_by_control = false;
                if self.publishers_available {
                    return self.transition(&[StreamingStatus::Resumed, StreamingStatus::Ready]);
                }
                Vec::new()
            }
            ControlType::StreamingDisabled => self.transition(&[StreamingStatus::Off]),
            _ => Vec::new(),
        }
    }

    /// The connection or the auth call failed.
    pub fn on_error(&mut self, retryable: bool) -> Vec<StreamingStatus> {
        if self.is_off() {
            return Vec::new();
        }
        if retryable {
            self.transition(&[StreamingStatus::Backoff])
        } else {
            self.transition(&[StreamingStatus::Off])
        }
    }

    fn transition(&mut self, statuses: &[StreamingStatus]) -> Vec<StreamingStatus> {
        if let Some(last) = statuses.last() {
            self.current = Some(*last);
        }
        statuses.to_vec()
    }
}
