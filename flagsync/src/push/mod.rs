//! Push side of the engine.
//!
//! [`StreamingClient`] owns the SSE socket and turns frames into [`Notification`]s.
//! They cross a bounded channel to the [`PushManager`], which drives the
//! [`StatusKeeper`] state machine and applies or schedules cache updates.

mod client;
mod compression;
mod manager;
mod notification;
mod sse;
mod status;

pub use client::{ConnectionOutcome, StreamConnector, StreamEvent, StreamingClient};
pub use compression::{Compression, decode_payload};
pub use manager::{PushManager, StatusPublisher, UpdateDispatcher};
pub use notification::{ControlType, Notification, RuleUpdate, StreamError, parse_event};
pub use sse::{EventParser, SseEvent};
pub use status::{StatusKeeper, StreamingStatus};

#[cfg(test)]
pub(crate) use compression::encode_payload;

#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("could not inflate payload: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown compression type {0}")]
    UnknownCompression(u8),
}
