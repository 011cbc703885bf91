//! Backend endpoints consumed by the engine.
//!
//! The traits are the seam between the synchronization logic and the transport.
//! [`HttpApi`] is the reqwest implementation used in production.

mod http;
mod token;

pub use http::HttpApi;
pub use token::{AuthToken, OCCUPANCY_PREFIX, TokenError};

#[cfg(test)]
pub(crate) use token::make_jwt;

use crate::config::ValidationError;
use crate::error::SyncError;
use crate::types::{ChangeNumber, RuleChanges, SegmentChanges};
use async_trait::async_trait;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Ask intermediaries not to serve a cached response.
    pub no_cache: bool,
    /// Target change number, sent to bypass stale CDN entries.
    pub till: Option<ChangeNumber>,
}

impl FetchOptions {
    pub fn on_demand() -> Self {
        FetchOptions {
            no_cache: true,
            till: None,
        }
    }

    pub fn cdn_bypass(till: ChangeNumber) -> Self {
        FetchOptions {
            no_cache: true,
            till: Some(till),
        }
    }
}

/// Failure to construct an HTTP-backed client.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("could not build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status}")]
    Status { status: u16, retryable: bool },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid token: {0}")]
    Token(#[from] TokenError),
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transport(_) => SyncError::TransientNetwork(err.to_string()),
            FetchError::Status {
                status: 400 | 401 | 403,
                retryable: false,
            } => SyncError::AuthRejected(err.to_string()),
            FetchError::Status { .. } => SyncError::TransientNetwork(err.to_string()),
            FetchError::Decode(_) | FetchError::Token(_) => {
                SyncError::MalformedPayload(err.to_string())
            }
            FetchError::InvalidUrl(_) => SyncError::TransientNetwork(err.to_string()),
        }
    }
}

/// Polling endpoints for flags, rule-based segments and segments.
#[async_trait]
pub trait ChangesApi: Send + Sync {
    async fn fetch_rules(
        &self,
        since: ChangeNumber,
        rb_since: ChangeNumber,
        options: &FetchOptions,
    ) -> Result<RuleChanges, FetchError>;

    async fn fetch_segment(
        &self,
        name: &str,
        since: ChangeNumber,
        options: &FetchOptions,
    ) -> Result<SegmentChanges, FetchError>;
}

/// Issues the short-lived token used by the streaming connection.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn authenticate(&self) -> Result<AuthToken, FetchError>;
}
