//! Keeps an in-memory copy of feature-flag targeting rules in sync with the
//! backend, by polling and by applying push notifications.
//!
//! [`SyncClient`] is the entry point. Evaluation itself is pluggable through
//! [`Evaluator`]; the engine only guarantees a consistent view of the rules.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod metrics_defs;
pub mod push;
pub mod readiness;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testutils;

pub use client::{ClientError, SyncClient};
pub use config::{Config, ValidationError};
pub use error::SyncError;
pub use evaluation::{CONTROL, EvaluationError, EvaluationStack, Evaluator, LookupError, RuleView};
pub use push::StreamingStatus;
pub use readiness::Resource;
pub use types::{ChangeNumber, RuleBasedSegment, Split};
