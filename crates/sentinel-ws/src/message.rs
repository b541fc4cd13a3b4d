//! Frame codec for the v2 streaming protocol.
//!
//! Inbound frames are JSON objects discriminated by either a `channel`
//! (market and account data, heartbeats, status) or a `method` (acks for
//! our own requests). Anything else is classified rather than rejected so
//! the read loop never has to tear the session down over a bad frame.

use crate::error::WsResult;
use crate::subscription::ChannelSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Channels understood by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Heartbeat,
    Status,
    Ticker,
    Book,
    Trade,
    Ohlc,
    /// Order and fill events (authenticated).
    Executions,
    /// Account balances (authenticated).
    Balances,
}

impl Channel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::Ticker => "ticker",
            Self::Book => "book",
            Self::Trade => "trade",
            Self::Ohlc => "ohlc",
            Self::Executions => "executions",
            Self::Balances => "balances",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "heartbeat" => Self::Heartbeat,
            "status" => Self::Status,
            "ticker" => Self::Ticker,
            "book" => Self::Book,
            "trade" => Self::Trade,
            "ohlc" => Self::Ohlc,
            "executions" => Self::Executions,
            "balances" => Self::Balances,
            _ => return None,
        })
    }

    /// Requires an auth token to subscribe.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Executions | Self::Balances)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Snapshot,
    #[default]
    Update,
}

/// Payload of a data channel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    pub channel: Channel,
    pub kind: UpdateKind,
    pub data: Vec<Value>,
}

/// Response to a subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodAck {
    pub method: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub req_id: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<AckResult>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AckResult {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl MethodAck {
    pub fn channel(&self) -> Option<Channel> {
        self.result
            .as_ref()
            .and_then(|r| r.channel.as_deref())
            .and_then(Channel::from_name)
    }
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Heartbeat,
    Status(Vec<Value>),
    Data(ChannelData),
    Ack(MethodAck),
    Pong { req_id: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    InvalidJson,
    NotObject,
    MissingDiscriminator,
    BadPayload,
}

impl MalformedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::NotObject => "not_object",
            Self::MissingDiscriminator => "missing_discriminator",
            Self::BadPayload => "bad_payload",
        }
    }
}

/// Classification of one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(StreamMessage),
    /// Failed shape validation.
    Malformed(MalformedReason),
    /// Well-formed, but the channel or method is not one we handle.
    Unrecognised(String),
}

#[derive(Deserialize)]
struct RawChannelFrame {
    #[serde(rename = "type", default)]
    kind: UpdateKind,
    #[serde(default)]
    data: Vec<Value>,
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Validate and classify an inbound text frame.
pub fn parse_frame(text: &str) -> Frame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Frame::Malformed(MalformedReason::InvalidJson),
    };
    let (channel_name, method_name) = match &value {
        Value::Object(obj) => (str_field(obj, "channel"), str_field(obj, "method")),
        _ => return Frame::Malformed(MalformedReason::NotObject),
    };

    if let Some(name) = channel_name {
        let Some(channel) = Channel::from_name(&name) else {
            return Frame::Unrecognised(name);
        };
        if channel == Channel::Heartbeat {
            return Frame::Message(StreamMessage::Heartbeat);
        }
        let raw: RawChannelFrame = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(_) => return Frame::Malformed(MalformedReason::BadPayload),
        };
        let msg = if channel == Channel::Status {
            StreamMessage::Status(raw.data)
        } else {
            StreamMessage::Data(ChannelData {
                channel,
                kind: raw.kind,
                data: raw.data,
            })
        };
        return Frame::Message(msg);
    }

    match method_name.as_deref() {
        Some("pong") => Frame::Message(StreamMessage::Pong {
            req_id: value.get("req_id").and_then(Value::as_u64),
        }),
        Some("subscribe") | Some("unsubscribe") => match serde_json::from_value(value) {
            Ok(ack) => Frame::Message(StreamMessage::Ack(ack)),
            Err(_) => Frame::Malformed(MalformedReason::BadPayload),
        },
        Some(other) => Frame::Unrecognised(other.to_string()),
        None => Frame::Malformed(MalformedReason::MissingDiscriminator),
    }
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Clone, Serialize)]
pub struct RequestParams {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub symbol: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl fmt::Debug for RequestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestParams")
            .field("channel", &self.channel)
            .field("symbol", &self.symbol)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
    pub req_id: u64,
}

impl Request {
    pub fn subscribe(spec: &ChannelSpec, token: Option<&str>, req_id: u64) -> Self {
        Self::with_params("subscribe", spec, token, req_id)
    }

    pub fn unsubscribe(spec: &ChannelSpec, token: Option<&str>, req_id: u64) -> Self {
        Self::with_params("unsubscribe", spec, token, req_id)
    }

    /// Application-level keepalive.
    pub fn ping(req_id: u64) -> Self {
        Self {
            method: "ping",
            params: None,
            req_id,
        }
    }

    fn with_params(
        method: &'static str,
        spec: &ChannelSpec,
        token: Option<&str>,
        req_id: u64,
    ) -> Self {
        Self {
            method,
            params: Some(RequestParams {
                channel: spec.channel(),
                symbol: spec.symbols().to_vec(),
                token: token
                    .filter(|_| spec.requires_token())
                    .map(str::to_owned),
            }),
            req_id,
        }
    }

    pub fn to_text(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ticker_snapshot() {
        let raw = json!({
            "channel": "ticker",
            "type": "snapshot",
            "data": [{"symbol": "XLM/USD", "bid": 0.25, "ask": 0.2502, "last": 0.2501}]
        })
        .to_string();

        match parse_frame(&raw) {
            Frame::Message(StreamMessage::Data(data)) => {
                assert_eq!(data.channel, Channel::Ticker);
                assert_eq!(data.kind, UpdateKind::Snapshot);
                assert_eq!(data.data.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_heartbeat_and_status() {
        assert_eq!(
            parse_frame(r#"{"channel":"heartbeat"}"#),
            Frame::Message(StreamMessage::Heartbeat)
        );
        let status = r#"{"channel":"status","type":"update","data":[{"system":"online"}]}"#;
        assert!(matches!(
            parse_frame(status),
            Frame::Message(StreamMessage::Status(data)) if data.len() == 1
        ));
    }

    #[test]
    fn test_parse_subscribe_ack() {
        let ok = r#"{"method":"subscribe","result":{"channel":"ticker","symbol":"XLM/USD"},"success":true,"req_id":7}"#;
        let Frame::Message(StreamMessage::Ack(ack)) = parse_frame(ok) else {
            panic!("expected ack");
        };
        assert!(ack.success);
        assert_eq!(ack.req_id, Some(7));
        assert_eq!(ack.channel(), Some(Channel::Ticker));

        let err = r#"{"method":"subscribe","error":"EGeneral:Invalid arguments","success":false,"req_id":8}"#;
        let Frame::Message(StreamMessage::Ack(ack)) = parse_frame(err) else {
            panic!("expected ack");
        };
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("EGeneral:Invalid arguments"));
        assert_eq!(ack.channel(), None);
    }

    #[test]
    fn test_parse_pong() {
        assert_eq!(
            parse_frame(r#"{"method":"pong","req_id":3,"time_in":"x","time_out":"y"}"#),
            Frame::Message(StreamMessage::Pong { req_id: Some(3) })
        );
    }

    #[test]
    fn test_malformed_frames_are_classified() {
        assert_eq!(
            parse_frame("not json"),
            Frame::Malformed(MalformedReason::InvalidJson)
        );
        assert_eq!(
            parse_frame("[1,2,3]"),
            Frame::Malformed(MalformedReason::NotObject)
        );
        assert_eq!(
            parse_frame(r#"{"foo":1}"#),
            Frame::Malformed(MalformedReason::MissingDiscriminator)
        );
        assert_eq!(
            parse_frame(r#"{"channel":"ticker","data":"oops"}"#),
            Frame::Malformed(MalformedReason::BadPayload)
        );
    }

    #[test]
    fn test_unknown_discriminators() {
        assert_eq!(
            parse_frame(r#"{"channel":"level3","data":[]}"#),
            Frame::Unrecognised("level3".to_string())
        );
        assert_eq!(
            parse_frame(r#"{"method":"add_order","success":true}"#),
            Frame::Unrecognised("add_order".to_string())
        );
    }

    #[test]
    fn test_subscribe_request_shape() {
        let spec = ChannelSpec::public(Channel::Ticker, ["XLM/USD"]);
        let text = Request::subscribe(&spec, None, 1).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "method": "subscribe",
                "params": {"channel": "ticker", "symbol": ["XLM/USD"]},
                "req_id": 1
            })
        );
    }

    #[test]
    fn test_private_request_carries_token_but_debug_redacts() {
        let spec = ChannelSpec::private(Channel::Executions);
        let req = Request::subscribe(&spec, Some("s3cr3t"), 2);
        let text = req.to_text().unwrap();
        assert!(text.contains(r#""token":"s3cr3t""#));
        assert!(!format!("{req:?}").contains("s3cr3t"));

        // public channels never carry the token
        let public = ChannelSpec::public(Channel::Book, ["XLM/USD"]);
        let text = Request::subscribe(&public, Some("s3cr3t"), 3).to_text().unwrap();
        assert!(!text.contains("token"));
    }

    #[test]
    fn test_ping_shape() {
        let text = Request::ping(9).to_text().unwrap();
        assert_eq!(text, r#"{"method":"ping","req_id":9}"#);
    }
}
