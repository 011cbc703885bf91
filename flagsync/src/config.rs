use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("sdk_key cannot be empty")]
    EmptySdkKey,

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("streaming safety refresh rate must not be shorter than the polling refresh rate")]
    SafetyIntervalTooShort,

    #[error("invalid flag set name: {0:?}")]
    InvalidFlagSet(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Urls {
    #[serde(default = "default_sdk_url")]
    pub sdk: Url,
    #[serde(default = "default_auth_url")]
    pub auth: Url,
    #[serde(default = "default_streaming_url")]
    pub streaming: Url,
}

fn parse_url(url: &str) -> Url {
    // Only called with the constant defaults below.
    Url::parse(url).unwrap_or_else(|e| panic!("invalid default url {url}: {e}"))
}

fn default_sdk_url() -> Url {
    parse_url("https://sdk.split.io/api")
}

fn default_auth_url() -> Url {
    parse_url("https://auth.split.io/api")
}

fn default_streaming_url() -> Url {
    parse_url("https://streaming.split.io")
}

impl Default for Urls {
    fn default() -> Self {
        Urls {
            sdk: default_sdk_url(),
            auth: default_auth_url(),
            streaming: default_streaming_url(),
        }
    }
}

/// Push connection tuning.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Drop the connection if nothing, not even a keep-alive comment, arrives for this long.
    pub keepalive_timeout_secs: u64,
    /// Relaxed polling interval used while push is healthy.
    pub safety_refresh_rate_secs: u64,
    /// Capacity of the channel between the socket reader and the notification manager.
    pub notification_buffer: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            keepalive_timeout_secs: 70,
            safety_refresh_rate_secs: 300,
            notification_buffer: 5_000,
        }
    }
}

/// Retry policy for fetches triggered by push notifications.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct OnDemandFetchConfig {
    pub retries: u32,
    pub backoff_ms: u64,
    pub cdn_bypass_retries: u32,
}

impl Default for OnDemandFetchConfig {
    fn default() -> Self {
        OnDemandFetchConfig {
            retries: 10,
            backoff_ms: 1_000,
            cdn_bypass_retries: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub sdk_key: String,
    #[serde(default)]
    pub urls: Urls,
    #[serde(default = "default_refresh_rate")]
    pub features_refresh_rate_secs: u64,
    #[serde(default = "default_refresh_rate")]
    pub segments_refresh_rate_secs: u64,
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    #[serde(default = "default_segment_workers")]
    pub segment_workers: usize,
    #[serde(default)]
    pub flag_sets_filter: Vec<String>,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Extra attempts for a polling request answered with a retriable status.
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub on_demand_fetch: OnDemandFetchConfig,
}

fn default_refresh_rate() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_segment_workers() -> usize {
    10
}

fn default_http_timeout() -> u64 {
    30
}

fn default_http_retries() -> u32 {
    2
}

impl Config {
    /// Configuration with defaults for everything but the key.
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Config {
            sdk_key: sdk_key.into(),
            urls: Urls::default(),
            features_refresh_rate_secs: default_refresh_rate(),
            segments_refresh_rate_secs: default_refresh_rate(),
            streaming_enabled: true,
            segment_workers: default_segment_workers(),
            flag_sets_filter: Vec::new(),
            http_timeout_secs: default_http_timeout(),
            http_retries: default_http_retries(),
            streaming: StreamingConfig::default(),
            on_demand_fetch: OnDemandFetchConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sdk_key.trim().is_empty() {
            return Err(ValidationError::EmptySdkKey);
        }

        for (name, value) in [
            ("features_refresh_rate_secs", self.features_refresh_rate_secs),
            ("segments_refresh_rate_secs", self.segments_refresh_rate_secs),
            ("segment_workers", self.segment_workers as u64),
            ("http_timeout_secs", self.http_timeout_secs),
            (
                "streaming.keepalive_timeout_secs",
                self.streaming.keepalive_timeout_secs,
            ),
            (
                "streaming.notification_buffer",
                self.streaming.notification_buffer as u64,
            ),
            ("streaming.backoff_base_ms", self.streaming.backoff_base_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::Zero(name));
            }
        }

        if self.streaming.safety_refresh_rate_secs
            < self
                .features_refresh_rate_secs
                .max(self.segments_refresh_rate_secs)
        {
            return Err(ValidationError::SafetyIntervalTooShort);
        }

        self.flag_sets()?;
        Ok(())
    }

    /// Normalized flag sets filter: trimmed, lower-cased and deduplicated.
    pub fn flag_sets(&self) -> Result<BTreeSet<String>, ValidationError> {
        self.flag_sets_filter
            .iter()
            .map(|raw| {
                let set = raw.trim().to_lowercase();
                if is_valid_flag_set(&set) {
                    Ok(set)
                } else {
                    Err(ValidationError::InvalidFlagSet(raw.clone()))
                }
            })
            .collect()
    }

    pub fn features_refresh_rate(&self) -> Duration {
        Duration::from_secs(self.features_refresh_rate_secs)
    }

    pub fn segments_refresh_rate(&self) -> Duration {
        Duration::from_secs(self.segments_refresh_rate_secs)
    }

    pub fn safety_refresh_rate(&self) -> Duration {
        Duration::from_secs(self.streaming.safety_refresh_rate_secs)
    }
}

// ^[a-z0-9][_a-z0-9]{0,49}$
fn is_valid_flag_set(set: &str) -> bool {
    let bytes = set.as_bytes();
    match bytes.split_first() {
        Some((first, rest)) => {
            (first.is_ascii_lowercase() || first.is_ascii_digit())
                && rest.len() <= 49
                && rest
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_')
        }
        None => false,
    }
}
