//! Peer data-channel envelopes
//!
//! Requests carry an application-defined `type`, so frames are decoded
//! through a flat [`WireFrame`] first and then classified. The reserved
//! types are `response`, `error`, `ping` and `pong`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Ask a host to run a chat completion
pub const REQUEST_CHAT: &str = "chat";

/// Ask a host which models it serves
pub const REQUEST_MODELS: &str = "models";

const TYPE_RESPONSE: &str = "response";
const TYPE_ERROR: &str = "error";
const TYPE_PING: &str = "ping";
const TYPE_PONG: &str = "pong";

/// A decoded peer message
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Request {
        kind: String,
        request_id: String,
        data: Value,
    },
    Response {
        request_id: String,
        data: Value,
    },
    Error {
        request_id: String,
        error: String,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

impl PeerMessage {
    pub fn request(kind: impl Into<String>, request_id: impl Into<String>, data: Value) -> Self {
        PeerMessage::Request {
            kind: kind.into(),
            request_id: request_id.into(),
            data,
        }
    }

    pub fn ping_now() -> Self {
        PeerMessage::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Correlation id, for messages that have one
    pub fn request_id(&self) -> Option<&str> {
        match self {
            PeerMessage::Request { request_id, .. }
            | PeerMessage::Response { request_id, .. }
            | PeerMessage::Error { request_id, .. } => Some(request_id),
            PeerMessage::Ping { .. } | PeerMessage::Pong { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let frame = match self {
            PeerMessage::Request { kind, request_id, data } => {
                if is_reserved(kind) {
                    return Err(Error::Protocol(format!(
                        "'{}' is reserved and cannot be used as a request type",
                        kind
                    )));
                }
                WireFrame {
                    kind: kind.clone(),
                    request_id: Some(request_id.clone()),
                    data: Some(data.clone()),
                    ..Default::default()
                }
            }
            PeerMessage::Response { request_id, data } => WireFrame {
                kind: TYPE_RESPONSE.to_string(),
                request_id: Some(request_id.clone()),
                data: Some(data.clone()),
                ..Default::default()
            },
            PeerMessage::Error { request_id, error } => WireFrame {
                kind: TYPE_ERROR.to_string(),
                request_id: Some(request_id.clone()),
                error: Some(error.clone()),
                ..Default::default()
            },
            PeerMessage::Ping { timestamp } => WireFrame {
                kind: TYPE_PING.to_string(),
                timestamp: Some(*timestamp),
                ..Default::default()
            },
            PeerMessage::Pong { timestamp } => WireFrame {
                kind: TYPE_PONG.to_string(),
                timestamp: Some(*timestamp),
                ..Default::default()
            },
        };

        Ok(serde_json::to_string(&frame)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let frame: WireFrame = serde_json::from_str(raw).map_err(|e| Error::ProtocolMalformed {
            message: e.to_string(),
        })?;

        let missing_id = |kind: &str| Error::ProtocolMalformed {
            message: format!("'{}' message without requestId", kind),
        };

        let msg = match frame.kind.as_str() {
            TYPE_PING => PeerMessage::Ping {
                timestamp: frame.timestamp.unwrap_or_default(),
            },
            TYPE_PONG => PeerMessage::Pong {
                timestamp: frame.timestamp.unwrap_or_default(),
            },
            TYPE_RESPONSE => PeerMessage::Response {
                request_id: frame.request_id.ok_or_else(|| missing_id(TYPE_RESPONSE))?,
                data: frame.data.unwrap_or(Value::Null),
            },
            TYPE_ERROR => PeerMessage::Error {
                request_id: frame.request_id.ok_or_else(|| missing_id(TYPE_ERROR))?,
                error: frame.error.unwrap_or_else(|| "unknown error".to_string()),
            },
            "" => {
                return Err(Error::ProtocolMalformed {
                    message: "empty message type".to_string(),
                })
            }
            _ => {
                let request_id = frame.request_id.ok_or_else(|| missing_id(&frame.kind))?;
                PeerMessage::Request {
                    kind: frame.kind,
                    request_id,
                    data: frame.data.unwrap_or(Value::Null),
                }
            }
        };

        Ok(msg)
    }
}

fn is_reserved(kind: &str) -> bool {
    matches!(kind, TYPE_RESPONSE | TYPE_ERROR | TYPE_PING | TYPE_PONG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let msg = PeerMessage::request(REQUEST_CHAT, "r-1", json!({"modelId": "llama2"}));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "chat", "requestId": "r-1", "data": {"modelId": "llama2"}})
        );
    }

    #[test]
    fn test_decode_error_reply() {
        let msg = PeerMessage::decode(r#"{"type":"error","requestId":"r-9","error":"model not loaded"}"#).unwrap();
        assert_eq!(
            msg,
            PeerMessage::Error {
                request_id: "r-9".into(),
                error: "model not loaded".into()
            }
        );
    }

    #[test]
    fn test_decode_custom_request_type() {
        let msg = PeerMessage::decode(r#"{"type":"embed","requestId":"x","data":[1,2]}"#).unwrap();
        match msg {
            PeerMessage::Request { kind, data, .. } => {
                assert_eq!(kind, "embed");
                assert_eq!(data, json!([1, 2]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reserved_request_type_rejected() {
        let msg = PeerMessage::request("pong", "r", Value::Null);
        assert!(msg.encode().is_err());
    }

    #[test]
    fn test_response_without_id_is_malformed() {
        let err = PeerMessage::decode(r#"{"type":"response","data":{}}"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(PeerMessage::decode("not json").is_err());
        assert!(PeerMessage::decode(r#"{"type":""}"#).is_err());
    }

    #[test]
    fn test_ping_has_no_request_id() {
        let ping = PeerMessage::ping_now();
        assert!(ping.request_id().is_none());
        let decoded = PeerMessage::decode(&ping.encode().unwrap()).unwrap();
        assert!(matches!(decoded, PeerMessage::Ping { .. }));
    }
}
