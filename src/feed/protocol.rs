//! Wire messages exchanged with the upstream push feed.
//!
//! The client only deals in [`ControlMessage`] and [`FeedEvent`]; how they
//! map to frames is up to a [`FrameCodec`]. [`JsonCodec`] is the default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::model::Tick;

/// Outbound control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe { code: String },
    Unsubscribe { code: String },
}

impl ControlMessage {
    pub fn code(&self) -> &str {
        match self {
            ControlMessage::Subscribe { code } | ControlMessage::Unsubscribe { code } => code,
        }
    }
}

/// Upstream answer to a subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionAck {
    pub code: String,
    pub accepted: bool,
    pub message: Option<String>,
}

/// Decoded inbound traffic, as seen by the client's reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    SubscriptionAck(SubscriptionAck),
    /// The transport ended. Carries the reason when one is known.
    Closed(Option<String>),
}

pub trait FrameCodec: Send + Sync {
    fn encode(&self, message: &ControlMessage) -> Result<String, FeedError>;

    /// `Ok(None)` for frames the client does not care about (heartbeats etc).
    fn decode(&self, frame: &str) -> Result<Option<FeedEvent>, FeedError>;
}

#[derive(Debug, Deserialize, Serialize)]
struct TickFrame {
    code: String,
    price: f64,
    change: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct SubscriptionResponse {
    status: String, // "ok" | "error"
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Tick(TickFrame),
    Subscription(SubscriptionResponse),
    Heartbeat,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn encode(&self, message: &ControlMessage) -> Result<String, FeedError> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, frame: &str) -> Result<Option<FeedEvent>, FeedError> {
        let event = match serde_json::from_str::<InboundFrame>(frame)? {
            InboundFrame::Tick(tick) => Some(FeedEvent::Tick(Tick {
                code: tick.code,
                price: tick.price,
                change: tick.change,
                timestamp: tick.timestamp,
            })),
            InboundFrame::Subscription(response) => Some(FeedEvent::SubscriptionAck(SubscriptionAck {
                accepted: response.status.eq_ignore_ascii_case("ok"),
                code: response.code,
                message: response.message,
            })),
            InboundFrame::Heartbeat => None,
        };
        Ok(event)
    }
}

/// Server-side helpers for producing frames in the JSON format, used by
/// local feed simulators and tests.
pub mod json_frames {
    use super::*;

    pub fn tick(tick: &Tick) -> String {
        serde_json::to_string(&InboundFrame::Tick(TickFrame {
            code: tick.code.clone(),
            price: tick.price,
            change: tick.change,
            timestamp: tick.timestamp,
        }))
        .unwrap_or_default()
    }

    pub fn subscription(code: &str, accepted: bool, message: Option<&str>) -> String {
        serde_json::to_string(&InboundFrame::Subscription(SubscriptionResponse {
            status: if accepted { "ok" } else { "error" }.to_string(),
            code: code.to_string(),
            message: message.map(str::to_string),
        }))
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_control_messages() {
        let codec = JsonCodec;
        let json = codec
            .encode(&ControlMessage::Subscribe { code: "005930".to_string() })
            .unwrap();
        assert_eq!(json, r#"{"action":"subscribe","code":"005930"}"#);

        let json = codec
            .encode(&ControlMessage::Unsubscribe { code: "005930".to_string() })
            .unwrap();
        assert_eq!(json, r#"{"action":"unsubscribe","code":"005930"}"#);
    }

    #[test]
    fn test_decode_tick() {
        let frame = r#"{"type":"tick","code":"005930","price":70000,"change":500,"timestamp":"2024-01-02T09:00:00Z"}"#;
        match JsonCodec.decode(frame).unwrap() {
            Some(FeedEvent::Tick(tick)) => {
                assert_eq!(tick.code, "005930");
                assert_eq!(tick.price, 70000.0);
                assert_eq!(tick.change, 500.0);
                assert_eq!(tick.timestamp.to_rfc3339(), "2024-01-02T09:00:00+00:00");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_subscription_responses() {
        let ok = JsonCodec
            .decode(r#"{"type":"subscription","status":"ok","code":"000660"}"#)
            .unwrap();
        assert_eq!(
            ok,
            Some(FeedEvent::SubscriptionAck(SubscriptionAck {
                code: "000660".to_string(),
                accepted: true,
                message: None,
            }))
        );

        let rejected = JsonCodec.decode(&json_frames::subscription("999999", false, Some("unknown code"))).unwrap();
        match rejected {
            Some(FeedEvent::SubscriptionAck(ack)) => {
                assert!(!ack.accepted);
                assert_eq!(ack.message.as_deref(), Some("unknown code"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_ignored_and_garbage_rejected() {
        assert_eq!(JsonCodec.decode(r#"{"type":"heartbeat"}"#).unwrap(), None);
        assert!(matches!(JsonCodec.decode("not json"), Err(FeedError::Codec(_))));
        assert!(JsonCodec.decode(r#"{"type":"tick","code":"005930"}"#).is_err());
    }
}
