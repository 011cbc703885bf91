use super::PayloadError;
use super::compression::{Compression, decode_payload};
use super::sse::SseEvent;
use crate::api::OCCUPANCY_PREFIX;
use crate::metrics_defs::STREAMING_MALFORMED_PAYLOADS;
use crate::types::{ChangeNumber, RuleBasedSegment, Split};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use shared::counter;

/// An update to a flag or rule-based segment.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleUpdate<T> {
    pub change_number: ChangeNumber,
    /// Change number the inline definition was computed against.
    pub previous_change_number: Option<ChangeNumber>,
    /// Decoded inline definition. `None` when absent or undecodable, in which case
    /// the change has to be fetched.
    pub definition: Option<T>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    StreamingPaused,
    StreamingResumed,
    StreamingDisabled,
}

/// Payload of an `event: error` frame.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    #[serde(default)]
    pub message: String,
    pub code: i64,
    #[serde(default)]
    pub status_code: i64,
}

impl StreamError {
    /// Token errors (401xx) are retried with a fresh token. Any other 4xxxx code is
    /// terminal; everything else is retried with backoff.
    pub fn is_retryable(&self) -> bool {
        (40140..=40149).contains(&self.code) || !(40000..=49999).contains(&self.code)
    }
}

/// Typed streaming notification.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    SplitUpdate(RuleUpdate<Split>),
    RuleBasedSegmentUpdate(RuleUpdate<RuleBasedSegment>),
    SplitKill {
        change_number: ChangeNumber,
        split_name: String,
        default_treatment: String,
    },
    SegmentUpdate {
        change_number: ChangeNumber,
        segment_name: String,
    },
    Control {
        channel: String,
        control_type: ControlType,
    },
    Occupancy {
        channel: String,
        publishers: u32,
        timestamp: i64,
    },
    Error(StreamError),
}

impl Notification {
    /// Tag used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::SplitUpdate(_) => "SPLIT_UPDATE",
            Notification::RuleBasedSegmentUpdate(_) => "RB_SEGMENT_UPDATE",
            Notification::SplitKill { .. } => "SPLIT_KILL",
            Notification::SegmentUpdate { .. } => "SEGMENT_UPDATE",
            Notification::Control { .. } => "CONTROL",
            Notification::Occupancy { .. } => "OCCUPANCY",
            Notification::Error(_) => "ERROR",
        }
    }
}

// {"id":..,"channel":"..","data":"<json string>","timestamp":..,"name":..}
#[derive(Deserialize)]
struct Envelope {
    channel: String,
    data: String,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Message {
    Occupancy { metrics: OccupancyMetrics },
    Typed(TypedMessage),
}

#[derive(Deserialize)]
struct OccupancyMetrics {
    publishers: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum TypedMessage {
    SplitUpdate(UpdatePayload),
    RbSegmentUpdate(UpdatePayload),
    #[serde(rename_all = "camelCase")]
    SplitKill {
        change_number: ChangeNumber,
        split_name: String,
        default_treatment: String,
    },
    #[serde(rename_all = "camelCase")]
    SegmentUpdate {
        change_number: ChangeNumber,
        segment_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Control { control_type: ControlType },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    change_number: ChangeNumber,
    #[serde(default)]
    pcn: Option<ChangeNumber>,
    /// Raw compression code; unknown codes drop the inline definition only.
    #[serde(default)]
    c: Option<u8>,
    #[serde(default)]
    d: Option<String>,
}

impl UpdatePayload {
    fn into_update<T: DeserializeOwned>(self) -> RuleUpdate<T> {
        let definition = self.d.and_then(|data| {
            match decode_definition(&data, self.c.unwrap_or(0)) {
                Ok(definition) => Some(definition),
                Err(e) => {
                    counter!(STREAMING_MALFORMED_PAYLOADS).increment(1);
                    tracing::warn!(
                        change_number = self.change_number,
                        error = %e,
                        "dropping undecodable inline payload"
                    );
                    None
                }
            }
        });

        RuleUpdate {
            change_number: self.change_number,
            previous_change_number: self.pcn,
            definition,
        }
    }
}

fn decode_definition<T: DeserializeOwned>(data: &str, code: u8) -> Result<T, PayloadError> {
    let bytes = decode_payload(data, Compression::try_from(code)?)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Channel name without the occupancy subscription prefix.
fn channel_name(channel: &str) -> String {
    channel
        .strip_prefix(OCCUPANCY_PREFIX)
        .unwrap_or(channel)
        .to_string()
}

/// Decodes one SSE event into a [`Notification`].
pub fn parse_event(event: &SseEvent) -> Result<Notification, PayloadError> {
    if event.event_type() == "error" {
        return Ok(Notification::Error(serde_json::from_str(&event.data)?));
    }

    let envelope: Envelope = serde_json::from_str(&event.data)?;
    let channel = channel_name(&envelope.channel);

    let notification = match serde_json::from_str(&envelope.data)? {
        Message::Occupancy { metrics } => Notification::Occupancy {
            channel,
            publishers: metrics.publishers,
            timestamp: envelope.timestamp,
        },
        Message::Typed(TypedMessage::SplitUpdate(payload)) => {
            Notification::SplitUpdate(payload.into_update())
        }
        Message::Typed(TypedMessage::RbSegmentUpdate(payload)) => {
            Notification::RuleBasedSegmentUpdate(payload.into_update())
        }
        Message::Typed(TypedMessage::SplitKill {
            change_number,
            split_name,
            default_treatment,
        }) => Notification::SplitKill {
            change_number,
            split_name,
            default_treatment,
        },
        Message::Typed(TypedMessage::SegmentUpdate {
            change_number,
            segment_name,
        }) => Notification::SegmentUpdate {
            change_number,
            segment_name,
        },
        Message::Typed(TypedMessage::Control { control_type }) => Notification::Control {
            channel,
            control_type,
        },
    };

    Ok(notification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::compression::encode_payload;

    fn message(channel: &str, data: &serde_json::Value) -> SseEvent {
        SseEvent {
            id: Some("abc".into()),
            event: Some("message".into()),
            data: serde_json::json!({
                "id": "abc",
                "clientId": "client",
                "timestamp": 1_700_000_000_000_i64,
                "encoding": "json",
                "channel": channel,
                "data": data.to_string(),
            })
            .to_string(),
        }
    }

    fn split_json() -> serde_json::Value {
        serde_json::json!({
            "name": "checkout",
            "changeNumber": 11,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "conditions": []
        })
    }

    #[test]
    fn test_split_update_without_payload() {
        let event = message(
            "xxxx_splits",
            &serde_json::json!({"type": "SPLIT_UPDATE", "changeNumber": 11}),
        );
        let notification = parse_event(&event).unwrap();
        assert_eq!(
            notification,
            Notification::SplitUpdate(RuleUpdate {
                change_number: 11,
                previous_change_number: None,
                definition: None,
            })
        );
        assert_eq!(notification.kind(), "SPLIT_UPDATE");
    }

    #[test]
    fn test_split_update_with_compressed_payload() {
        for (code, compression) in [
            (0, Compression::None),
            (1, Compression::Gzip),
            (2, Compression::Zlib),
        ] {
            let d = encode_payload(split_json().to_string().as_bytes(), compression);
            let event = message(
                "xxxx_splits",
                &serde_json::json!({
                    "type": "SPLIT_UPDATE",
                    "changeNumber": 11,
                    "pcn": 10,
                    "c": code,
                    "d": d,
                }),
            );

            let Notification::SplitUpdate(update) = parse_event(&event).unwrap() else {
                panic!("expected a split update");
            };
            assert_eq!(update.previous_change_number, Some(10));
            let split = update.definition.unwrap();
            assert_eq!(split.name, "checkout");
            assert_eq!(split.change_number, 11);
        }
    }

    #[test]
    fn test_undecodable_payload_falls_back_to_fetch() {
        let event = message(
            "xxxx_splits",
            &serde_json::json!({
                "type": "SPLIT_UPDATE",
                "changeNumber": 11,
                "c": 1,
                "d": "bm90IGd6aXA=",
            }),
        );
        let Notification::SplitUpdate(update) = parse_event(&event).unwrap() else {
            panic!("expected a split update");
        };
        assert_eq!(update.change_number, 11);
        assert!(update.definition.is_none());
    }

    #[test]
    fn test_unknown_compression_keeps_change_number() {
        let d = encode_payload(split_json().to_string().as_bytes(), Compression::None);
        let event = message(
            "xxxx_splits",
            &serde_json::json!({
                "type": "SPLIT_UPDATE",
                "changeNumber": 11,
                "pcn": 10,
                "c": 3,
                "d": d,
            }),
        );
        let Notification::SplitUpdate(update) = parse_event(&event).unwrap() else {
            panic!("expected a split update");
        };
        assert_eq!(update.change_number, 11);
        assert_eq!(update.previous_change_number, Some(10));
        assert!(update.definition.is_none());
    }

    #[test]
    fn test_rule_based_segment_update() {
        let rbs = serde_json::json!({
            "name": "rbs",
            "changeNumber": 4,
            "status": "ACTIVE",
            "excluded": {"keys": ["k"], "segments": []},
            "conditions": []
        });
        let event = message(
            "xxxx_splits",
            &serde_json::json!({
                "type": "RB_SEGMENT_UPDATE",
                "changeNumber": 4,
                "pcn": 3,
                "c": 0,
                "d": encode_payload(rbs.to_string().as_bytes(), Compression::None),
            }),
        );
        let Notification::RuleBasedSegmentUpdate(update) = parse_event(&event).unwrap() else {
            panic!("expected a rule-based segment update");
        };
        assert_eq!(update.definition.unwrap().name, "rbs");
    }

    #[test]
    fn test_kill_and_segment_update() {
        let kill = message(
            "xxxx_splits",
            &serde_json::json!({
                "type": "SPLIT_KILL",
                "changeNumber": 12,
                "splitName": "checkout",
                "defaultTreatment": "off"
            }),
        );
        assert_eq!(
            parse_event(&kill).unwrap(),
            Notification::SplitKill {
                change_number: 12,
                split_name: "checkout".into(),
                default_treatment: "off".into(),
            }
        );

        let segment = message(
            "xxxx_segments",
            &serde_json::json!({
                "type": "SEGMENT_UPDATE",
                "changeNumber": 5,
                "segmentName": "employees"
            }),
        );
        assert_eq!(
            parse_event(&segment).unwrap(),
            Notification::SegmentUpdate {
                change_number: 5,
                segment_name: "employees".into(),
            }
        );
    }

    #[test]
    fn test_control_and_occupancy() {
        let control = message(
            "[?occupancy=metrics.publishers]control_pri",
            &serde_json::json!({"type": "CONTROL", "controlType": "STREAMING_PAUSED"}),
        );
        assert_eq!(
            parse_event(&control).unwrap(),
            Notification::Control {
                channel: "control_pri".into(),
                control_type: ControlType::StreamingPaused,
            }
        );

        let occupancy = message(
            "[?occupancy=metrics.publishers]control_sec",
            &serde_json::json!({"metrics": {"publishers": 2}}),
        );
        assert_eq!(
            parse_event(&occupancy).unwrap(),
            Notification::Occupancy {
                channel: "control_sec".into(),
                publishers: 2,
                timestamp: 1_700_000_000_000,
            }
        );
    }

    #[test]
    fn test_error_event() {
        let event = SseEvent {
            id: None,
            event: Some("error".into()),
            data: r#"{"message":"Token expired","code":40142,"statusCode":401}"#.into(),
        };
        let Notification::Error(error) = parse_event(&event).unwrap() else {
            panic!("expected an error");
        };
        assert_eq!(error.status_code, 401);
        assert!(error.is_retryable());

        let terminal = StreamError {
            message: "invalid key".into(),
            code: 40003,
            status_code: 400,
        };
        assert!(!terminal.is_retryable());
        let server = StreamError {
            message: "internal".into(),
            code: 50000,
            status_code: 500,
        };
        assert!(server.is_retryable());
    }

    #[test]
    fn test_malformed_messages() {
        let bad_envelope = SseEvent {
            data: "not json".into(),
            ..Default::default()
        };
        assert!(matches!(
            parse_event(&bad_envelope),
            Err(PayloadError::Json(_))
        ));

        let unknown_type = message(
            "xxxx_splits",
            &serde_json::json!({"type": "SOMETHING_NEW", "changeNumber": 1}),
        );
        assert!(parse_event(&unknown_type).is_err());
    }
}
