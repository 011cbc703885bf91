use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Query prefix asking the push service to deliver occupancy metadata for a channel.
pub const OCCUPANCY_PREFIX: &str = "[?occupancy=metrics.publishers]";

const PUBLISHERS_CAPABILITY: &str = "channel-metadata:publishers";

// Refresh tokens this long before they expire.
const REFRESH_GRACE_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not a JWT")]
    Format,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug)]
struct Claims {
    #[serde(rename = "x-ably-capability")]
    capability: String,
    #[serde(default)]
    iat: Option<u64>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Result of `GET /auth`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub push_enabled: bool,
    pub token: String,
    /// Channels to subscribe to, control channels already carrying the occupancy prefix.
    pub channels: Vec<String>,
    pub issued_at: Option<u64>,
    pub expires_at: Option<u64>,
    /// Delay requested by the backend before opening the connection.
    pub connect_delay: Option<Duration>,
}

impl AuthToken {
    pub fn disabled() -> Self {
        AuthToken {
            push_enabled: false,
            token: String::new(),
            channels: Vec::new(),
            issued_at: None,
            expires_at: None,
            connect_delay: None,
        }
    }

    /// Builds a token from the raw JWT, reading channels and lifetime from its claims.
    pub fn from_jwt(jwt: &str, connect_delay: Option<Duration>) -> Result<Self, TokenError> {
        let payload = jwt.split('.').nth(1).ok_or(TokenError::Format)?;
        let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=').as_bytes())?;
        let claims: Claims = serde_json::from_slice(&decoded)?;
        let capability: BTreeMap<String, Vec<String>> = serde_json::from_str(&claims.capability)?;

        let channels = capability
            .into_iter()
            .map(|(channel, permissions)| {
                if permissions.iter().any(|p| p == PUBLISHERS_CAPABILITY) {
                    format!("{OCCUPANCY_PREFIX}{channel}")
                } else {
                    channel
                }
            })
            .collect();

        Ok(AuthToken {
            push_enabled: true,
            token: jwt.to_string(),
            channels,
            issued_at: claims.iat,
            expires_at: claims.exp,
            connect_delay,
        })
    }

    /// Replaces the channels read from the JWT with an explicit list. Channels
    /// that carried the occupancy prefix in the JWT, and control channels, keep it.
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        let occupancy: Vec<&str> = self
            .channels
            .iter()
            .filter_map(|c| c.strip_prefix(OCCUPANCY_PREFIX))
            .collect();

        let channels = channels
            .into_iter()
            .map(|channel| {
                let name = channel.strip_prefix(OCCUPANCY_PREFIX).unwrap_or(&channel);
                if occupancy.contains(&name) || name.starts_with("control_") {
                    format!("{OCCUPANCY_PREFIX}{name}")
                } else {
                    channel
                }
            })
            .collect();

        self.channels = channels;
        self
    }

    /// How long after issue the token should be replaced.
    pub fn refresh_in(&self) -> Option<Duration> {
        let lifetime = self.expires_at?.checked_sub(self.issued_at?)?;
        let secs = if lifetime > REFRESH_GRACE_SECS {
            lifetime - REFRESH_GRACE_SECS
        } else {
            lifetime / 2
        };
        Some(Duration::from_secs(secs.max(1)))
    }
}

#[cfg(test)]
pub(crate) fn make_jwt(capability: &serde_json::Value, iat: u64, exp: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "x-ably-capability": capability.to_string(),
        "x-ably-clientId": "client",
        "iat": iat,
        "exp": exp,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_from_capability() {
        let capability = serde_json::json!({
            "xxxx_splits": ["subscribe"],
            "xxxx_segments": ["subscribe"],
            "control_pri": ["subscribe", "channel-metadata:publishers"],
            "control_sec": ["subscribe", "channel-metadata:publishers"],
        });
        let jwt = make_jwt(&capability, 1_000, 4_600);

        let token = AuthToken::from_jwt(&jwt, Some(Duration::from_secs(60))).unwrap();
        assert!(token.push_enabled);
        assert_eq!(
            token.channels,
            vec![
                "[?occupancy=metrics.publishers]control_pri".to_string(),
                "[?occupancy=metrics.publishers]control_sec".to_string(),
                "xxxx_segments".to_string(),
                "xxxx_splits".to_string(),
            ]
        );
        assert_eq!(token.refresh_in(), Some(Duration::from_secs(3_000)));
        assert_eq!(token.connect_delay, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_explicit_channels_keep_occupancy_prefix() {
        let capability = serde_json::json!({
            "xxxx_splits": ["subscribe"],
            "control_pri": ["subscribe", "channel-metadata:publishers"],
        });
        let jwt = make_jwt(&capability, 0, 3_600);
        let token = AuthToken::from_jwt(&jwt, None).unwrap().with_channels(vec![
            "xxxx_splits".to_string(),
            "control_pri".to_string(),
            "control_sec".to_string(),
            "[?occupancy=metrics.publishers]xxxx_flags".to_string(),
        ]);
        assert_eq!(
            token.channels,
            vec![
                "xxxx_splits".to_string(),
                "[?occupancy=metrics.publishers]control_pri".to_string(),
                "[?occupancy=metrics.publishers]control_sec".to_string(),
                "[?occupancy=metrics.publishers]xxxx_flags".to_string(),
            ]
        );
    }

    #[test]
    fn test_short_lived_token_refresh() {
        let jwt = make_jwt(&serde_json::json!({"a": ["subscribe"]}), 0, 300);
        let token = AuthToken::from_jwt(&jwt, None).unwrap();
        assert_eq!(token.refresh_in(), Some(Duration::from_secs(150)));
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(matches!(
            AuthToken::from_jwt("not-a-jwt", None),
            Err(TokenError::Format)
        ));
        assert!(matches!(
            AuthToken::from_jwt("a.!!!.c", None),
            Err(TokenError::Base64(_))
        ));
        let garbage = URL_SAFE_NO_PAD.encode(b"{}");
        assert!(matches!(
            AuthToken::from_jwt(&format!("a.{garbage}.c"), None),
            Err(TokenError::Json(_))
        ));
    }
}
