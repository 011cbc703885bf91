use super::{AuthApi, AuthToken, BuildError, ChangesApi, FetchError, FetchOptions};
use crate::config::Config;
use crate::types::{ChangeNumber, RuleChanges, SegmentChanges};
use async_trait::async_trait;
use reqwest::{StatusCode, Url, header};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::sleep;

const BASE_DELAY: u64 = 500;

const SPEC_VERSION: &str = "1.3";

const SDK_VERSION: &str = concat!("flagsync-", env!("CARGO_PKG_VERSION"));

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::REQUEST_TIMEOUT,       // 408
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

fn is_retriable(status: StatusCode) -> bool {
    RETRIABLE_STATUS_CODES.contains(&status) || status.is_server_error()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    push_enabled: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    channels: Option<Vec<String>>,
    #[serde(default)]
    conn_delay: Option<u64>,
}

/// reqwest-backed implementation of the polling and auth endpoints.
pub struct HttpApi {
    client: reqwest::Client,
    sdk_key: String,
    sdk_url: String,
    auth_url: String,
    flag_sets: BTreeSet<String>,
    retries: u32,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        let flag_sets = config.flag_sets()?;

        Ok(HttpApi {
            client,
            sdk_key: config.sdk_key.clone(),
            sdk_url: config.urls.sdk.as_str().trim_end_matches('/').to_string(),
            auth_url: config.urls.auth.as_str().trim_end_matches('/').to_string(),
            flag_sets,
            retries: config.http_retries,
        })
    }

    fn url(&self, base: &str, path: &str) -> Result<Url, FetchError> {
        Url::parse(&format!("{base}/{path}")).map_err(|e| FetchError::InvalidUrl(e.to_string()))
    }

    /// Sends a GET, retrying retriable statuses with exponential backoff.
    async fn get(&self, url: Url, options: &FetchOptions) -> Result<reqwest::Response, FetchError> {
        let mut retries = 0;

        loop {
            let mut request = self
                .client
                .get(url.clone())
                .bearer_auth(&self.sdk_key)
                .header("SplitSDKVersion", SDK_VERSION);

            if options.no_cache {
                request = request.header(header::CACHE_CONTROL, "no-cache");
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            if is_retriable(status) && retries < self.retries {
                let retry_millis = BASE_DELAY * 2_u64.pow(retries);
                tracing::debug!(%status, retry_millis, path = url.path(), "retrying request");
                sleep(Duration::from_millis(retry_millis)).await;
                retries += 1;
                continue;
            }

            return Err(FetchError::Status {
                status: status.as_u16(),
                retryable: is_retriable(status),
            });
        }
    }
}

#[async_trait]
impl ChangesApi for HttpApi {
    async fn fetch_rules(
        &self,
        since: ChangeNumber,
        rb_since: ChangeNumber,
        options: &FetchOptions,
    ) -> Result<RuleChanges, FetchError> {
        let mut url = self.url(&self.sdk_url, "splitChanges")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("s", SPEC_VERSION)
                .append_pair("since", &since.to_string())
                .append_pair("rbSince", &rb_since.to_string());
            if !self.flag_sets.is_empty() {
                let sets: Vec<&str> = self.flag_sets.iter().map(String::as_str).collect();
                query.append_pair("sets", &sets.join(","));
            }
            if let Some(till) = options.till {
                query.append_pair("till", &till.to_string());
            }
        }

        let response = self.get(url, options).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch_segment(
        &self,
        name: &str,
        since: ChangeNumber,
        options: &FetchOptions,
    ) -> Result<SegmentChanges, FetchError> {
        let mut url = self.url(&self.sdk_url, "segmentChanges")?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.sdk_url.clone()))?
            .push(name);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("since", &since.to_string());
            if let Some(till) = options.till {
                query.append_pair("till", &till.to_string());
            }
        }

        let response = self.get(url, options).await?;
        let bytes = response.bytes().await?;
        let mut changes: SegmentChanges = serde_json::from_slice(&bytes)?;
        if changes.name.is_empty() {
            changes.name = name.to_string();
        }
        Ok(changes)
    }
}

#[async_trait]
impl AuthApi for HttpApi {
    async fn authenticate(&self) -> Result<AuthToken, FetchError> {
        let mut url = self.url(&self.auth_url, "v2/auth")?;
        url.query_pairs_mut().append_pair("s", SPEC_VERSION);

        let response = self.get(url, &FetchOptions::default()).await?;
        let bytes = response.bytes().await?;
        let auth: AuthResponse = serde_json::from_slice(&bytes)?;

        let conn_delay = auth.conn_delay.map(Duration::from_secs);
        match auth.token {
            Some(token) if auth.push_enabled => {
                let parsed = AuthToken::from_jwt(&token, conn_delay)?;
                Ok(match auth.channels {
                    Some(channels) => parsed.with_channels(channels),
                    None => parsed,
                })
            }
            _ => Ok(AuthToken::disabled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::token::make_jwt;
    use crate::config::ValidationError;
    use crate::error::SyncError;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer) -> HttpApi {
        let mut config = Config::new("sdk-key");
        config.urls.sdk = Url::parse(&format!("{}/api", server.uri())).unwrap();
        config.urls.auth = Url::parse(&format!("{}/auth", server.uri())).unwrap();
        config.http_retries = 0;
        HttpApi::new(&config).unwrap()
    }

    #[test]
    fn test_invalid_flag_set() {
        let mut config = Config::new("sdk-key");
        config.flag_sets_filter = vec!["_leading_underscore".into()];
        assert!(matches!(
            HttpApi::new(&config),
            Err(BuildError::Config(ValidationError::InvalidFlagSet(_)))
        ));
    }

    #[tokio::test]
    async fn test_fetch_rules() {
        let server = MockServer::start().await;

        let body = serde_json::json!({
            "ff": {
                "s": 10,
                "t": 20,
                "d": [{
                    "name": "checkout",
                    "changeNumber": 20,
                    "status": "ACTIVE",
                    "defaultTreatment": "off",
                    "conditions": []
                }]
            },
            "rbs": {"s": 5, "t": 5, "d": []}
        });

        Mock::given(method("GET"))
            .and(path("/api/splitChanges"))
            .and(query_param("s", "1.3"))
            .and(query_param("since", "10"))
            .and(query_param("rbSince", "5"))
            .and(header("Authorization", "Bearer sdk-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let api = api_for(&server);
        let changes = api
            .fetch_rules(10, 5, &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(changes.ff.since, 10);
        assert_eq!(changes.ff.till, 20);
        assert_eq!(changes.ff.data[0].name, "checkout");
        assert_eq!(changes.rbs.till, 5);
    }

    #[tokio::test]
    async fn test_cdn_bypass_options() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/segmentChanges/employees"))
            .and(query_param("since", "3"))
            .and(query_param("till", "9"))
            .and(header("Cache-Control", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "since": 3,
                "till": 9,
                "added": ["a"],
                "removed": []
            })))
            .mount(&server)
            .await;

        let api = api_for(&server);
        let changes = api
            .fetch_segment("employees", 3, &FetchOptions::cdn_bypass(9))
            .await
            .unwrap();

        // Name is filled from the request when the backend omits it
        assert_eq!(changes.name, "employees");
        assert_eq!(changes.added, vec!["a"]);
    }

    #[tokio::test]
    async fn test_status_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/splitChanges"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/segmentChanges/employees"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = api_for(&server);

        let err = api
            .fetch_rules(-1, -1, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Status {
                status: 503,
                retryable: true
            }
        ));
        assert!(SyncError::from(err).is_retryable());

        let err = api
            .fetch_segment("employees", -1, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/splitChanges"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let api = api_for(&server);
        let err = api
            .fetch_rules(-1, -1, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            SyncError::from(err),
            SyncError::MalformedPayload(_)
        ));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        let jwt = make_jwt(
            &serde_json::json!({
                "abc_splits": ["subscribe"],
                "control_pri": ["subscribe", "channel-metadata:publishers"],
            }),
            100,
            3700,
        );

        Mock::given(method("GET"))
            .and(path("/auth/v2/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pushEnabled": true,
                "token": jwt,
                "connDelay": 0
            })))
            .mount(&server)
            .await;

        let api = api_for(&server);
        let token = api.authenticate().await.unwrap();

        assert!(token.push_enabled);
        assert_eq!(token.channels.len(), 2);
        assert!(
            token
                .channels
                .contains(&"[?occupancy=metrics.publishers]control_pri".to_string())
        );
        assert_eq!(token.connect_delay, Some(Duration::from_secs(0)));
    }

    #[tokio::test]
    async fn test_authenticate_explicit_channels() {
        let server = MockServer::start().await;
        let jwt = make_jwt(
            &serde_json::json!({
                "abc_splits": ["subscribe"],
                "control_pri": ["subscribe", "channel-metadata:publishers"],
            }),
            100,
            3700,
        );

        Mock::given(method("GET"))
            .and(path("/auth/v2/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pushEnabled": true,
                "token": jwt,
                "channels": ["x_splits", "control_pri"]
            })))
            .mount(&server)
            .await;

        let api = api_for(&server);
        let token = api.authenticate().await.unwrap();
        assert_eq!(
            token.channels,
            vec![
                "x_splits".to_string(),
                "[?occupancy=metrics.publishers]control_pri".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_authenticate_push_disabled() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/v2/auth"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"pushEnabled": false})),
            )
            .mount(&server)
            .await;

        let api = api_for(&server);
        assert!(!api.authenticate().await.unwrap().push_enabled);
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/v2/auth"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = api_for(&server);
        let err = api.authenticate().await.unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::AuthRejected(_)));
    }
}
