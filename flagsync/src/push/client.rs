use super::notification::{Notification, StreamError, parse_event};
use super::sse::EventParser;
use crate::api::{AuthToken, BuildError};
use crate::config::Config;
use crate::metrics_defs::STREAMING_MALFORMED_PAYLOADS;
use crate::sync::Shutdown;
use async_trait::async_trait;
use reqwest::{StatusCode, Url, header};
use serde::Deserialize;
use shared::counter;
use std::time::Duration;
use tokio::sync::mpsc;

const PROTOCOL_VERSION: &str = "1.1";

/// What the connection task hands to the push manager.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// The push service accepted the connection.
    Connected,
    Notification(Notification),
}

/// How a connection ended.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionOutcome {
    /// Reconnect after backoff.
    Retryable(String),
    /// Give up on push.
    NonRetryable(String),
    /// Stopped by the caller.
    Cancelled,
}

/// Opens the push connection and forwards events until it ends.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        token: &AuthToken,
        events: mpsc::Sender<StreamEvent>,
        shutdown: Shutdown,
    ) -> ConnectionOutcome;
}

#[derive(Deserialize)]
struct RejectionBody {
    error: StreamError,
}

/// SSE client for the push endpoint, backed by reqwest.
pub struct StreamingClient {
    client: reqwest::Client,
    base_url: Url,
    keepalive: Duration,
}

impl StreamingClient {
    pub fn new(config: &Config) -> Result<Self, BuildError> {
        // No overall timeout: the response body is expected to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;

        Ok(StreamingClient {
            client,
            base_url: config.urls.streaming.clone(),
            keepalive: Duration::from_secs(config.streaming.keepalive_timeout_secs),
        })
    }

    #[cfg(test)]
    fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    fn url(&self, token: &AuthToken) -> Result<Url, url::ParseError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/sse"))?;
        url.query_pairs_mut()
            .append_pair("channels", &token.channels.join(","))
            .append_pair("accessToken", &token.token)
            .append_pair("v", PROTOCOL_VERSION);
        Ok(url)
    }
}

/// Maps a refused connection to an outcome, preferring the error code in the body.
fn classify_rejection(status: StatusCode, body: &str) -> ConnectionOutcome {
    if let Ok(rejection) = serde_json::from_str::<RejectionBody>(body) {
        let reason = format!(
            "{} (code {}, status {})",
            rejection.error.message, rejection.error.code, status
        );
        return match rejection.error.is_retryable() {
            true => ConnectionOutcome::Retryable(reason),
            false => ConnectionOutcome::NonRetryable(reason),
        };
    }

    let reason = format!("push endpoint returned {status}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ConnectionOutcome::Retryable(reason)
    } else {
        ConnectionOutcome::NonRetryable(reason)
    }
}

#[async_trait]
impl StreamConnector for StreamingClient {
    async fn connect(
        &self,
        token: &AuthToken,
        events: mpsc::Sender<StreamEvent>,
        mut shutdown: Shutdown,
    ) -> ConnectionOutcome {
        let url = match self.url(token) {
            Ok(url) => url,
            Err(e) => return ConnectionOutcome::NonRetryable(format!("invalid streaming URL: {e}")),
        };

        let request = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send();

        let response = tokio::select! {
            _ = shutdown.wait() => return ConnectionOutcome::Cancelled,
            response = tokio::time::timeout(self.keepalive, request) => response,
        };
        let mut response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return ConnectionOutcome::Retryable(e.to_string()),
            Err(_) => return ConnectionOutcome::Retryable("timed out waiting for the push endpoint".into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return classify_rejection(status, &body);
        }

        tracing::info!("streaming connection established");
        if events.send(StreamEvent::Connected).await.is_err() {
            return ConnectionOutcome::Cancelled;
        }

        let mut parser = EventParser::new();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.wait() => return ConnectionOutcome::Cancelled,
                chunk = tokio::time::timeout(self.keepalive, response.chunk()) => chunk,
            };
            let bytes = match chunk {
                Ok(Ok(Some(bytes))) => bytes,
                Ok(Ok(None)) => return ConnectionOutcome::Retryable("stream closed by the server".into()),
                Ok(Err(e)) => return ConnectionOutcome::Retryable(e.to_string()),
                Err(_) => {
                    return ConnectionOutcome::Retryable(format!(
                        "no data received for {:?}",
                        self.keepalive
                    ));
                }
            };

            for event in parser.feed(&bytes) {
                let notification = match parse_event(&event) {
                    Ok(notification) => notification,
                    Err(e) => {
                        counter!(STREAMING_MALFORMED_PAYLOADS).increment(1);
                        tracing::warn!(error = %e, event_id = ?event.id, "dropping malformed streaming message");
                        continue;
                    }
                };

                let error = match &notification {
                    Notification::Error(error) => Some(error.clone()),
                    _ => None,
                };
                if events.send(StreamEvent::Notification(notification)).await.is_err() {
                    return ConnectionOutcome::Cancelled;
                }
                if let Some(error) = error {
                    let reason = format!("{} (code {})", error.message, error.code);
                    return match error.is_retryable() {
                        true => ConnectionOutcome::Retryable(reason),
                        false => ConnectionOutcome::NonRetryable(reason),
                    };
                }
            }
        }
    }
}
