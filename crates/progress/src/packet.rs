//! Socket.IO v4 packets carried in Engine.IO v4 text frames.
//!
//! Only the subset the progress channel needs: handshake, heartbeat,
//! namespace connect/disconnect and plain JSON events.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet type: {0:?}")]
    UnknownType(char),

    #[error("invalid payload: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, PacketError>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    // Engine.IO
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Upgrade,
    Noop,

    // Socket.IO
    Connect {
        namespace: String,
        data: Option<JsonValue>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        name: String,
        args: Vec<JsonValue>,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
    /// Acks and binary packets; the progress backend never sends them.
    Unsupported(char),
}

pub fn decode(text: &str) -> Result<Frame> {
    let mut chars = text.chars();
    let ty = chars.next().ok_or(PacketError::Empty)?;
    let rest = chars.as_str();

    match ty {
        '0' => serde_json::from_str(rest)
            .map(Frame::Open)
            .map_err(|e| PacketError::Payload(e.to_string())),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping(rest.to_string())),
        '3' => Ok(Frame::Pong(rest.to_string())),
        '4' => decode_socket(rest),
        '5' => Ok(Frame::Upgrade),
        '6' => Ok(Frame::Noop),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn decode_socket(text: &str) -> Result<Frame> {
    let mut chars = text.chars();
    let ty = chars.next().ok_or(PacketError::Empty)?;
    let (namespace, rest) = split_namespace(chars.as_str());

    match ty {
        '0' => Ok(Frame::Connect {
            namespace,
            data: parse_optional(rest)?,
        }),
        '1' => Ok(Frame::Disconnect { namespace }),
        '2' => {
            // optional ack id
            let body = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let mut args = match serde_json::from_str::<JsonValue>(body) {
                Ok(JsonValue::Array(items)) => items,
                Ok(_) => return Err(PacketError::Payload("event is not an array".into())),
                Err(e) => return Err(PacketError::Payload(e.to_string())),
            };
            if args.is_empty() {
                return Err(PacketError::Payload("event without name".into()));
            }
            let name = match args.remove(0) {
                JsonValue::String(s) => s,
                _ => return Err(PacketError::Payload("event name is not a string".into())),
            };
            Ok(Frame::Event { namespace, name, args })
        }
        '4' => {
            let message = match parse_optional(rest)? {
                Some(JsonValue::Object(map)) => map
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("connect error")
                    .to_string(),
                Some(JsonValue::String(s)) => s,
                _ => "connect error".to_string(),
            };
            Ok(Frame::ConnectError { namespace, message })
        }
        '3' | '5' | '6' => Ok(Frame::Unsupported(ty)),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn split_namespace(text: &str) -> (String, &str) {
    if !text.starts_with('/') {
        return (DEFAULT_NAMESPACE.to_string(), text);
    }
    match text.find(',') {
        Some(i) => (text[..i].to_string(), &text[i + 1..]),
        None => (text.to_string(), ""),
    }
}

fn parse_optional(text: &str) -> Result<Option<JsonValue>> {
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| PacketError::Payload(e.to_string()))
}

/// Socket.IO connect to the default namespace, with optional auth payload.
pub fn encode_connect(auth: Option<&JsonValue>) -> String {
    match auth {
        Some(a) => format!("40{a}"),
        None => "40".to_string(),
    }
}

pub fn encode_event(name: &str, args: &[JsonValue]) -> String {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(JsonValue::String(name.to_string()));
    items.extend(args.iter().cloned());
    format!("42{}", JsonValue::Array(items))
}

pub fn encode_pong(payload: &str) -> String {
    format!("3{payload}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open() {
        let f = decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#).unwrap();
        assert_eq!(
            f,
            Frame::Open(Handshake {
                sid: "abc".into(),
                upgrades: vec![],
                ping_interval: 25000,
                ping_timeout: 20000,
            })
        );
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(decode("2").unwrap(), Frame::Ping(String::new()));
        assert_eq!(decode("2probe").unwrap(), Frame::Ping("probe".into()));
        assert_eq!(encode_pong("probe"), "3probe");
    }

    #[test]
    fn test_event() {
        let f = decode(r#"42["export:progress",{"jobId":"exp-1","processed":10}]"#).unwrap();
        assert_eq!(
            f,
            Frame::Event {
                namespace: "/".into(),
                name: "export:progress".into(),
                args: vec![json!({"jobId": "exp-1", "processed": 10})],
            }
        );
    }

    #[test]
    fn test_event_with_namespace_and_ack() {
        let f = decode(r#"42/jobs,17["import:progress",{"jobId":"i"}]"#).unwrap();
        match f {
            Frame::Event { namespace, name, args } => {
                assert_eq!(namespace, "/jobs");
                assert_eq!(name, "import:progress");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_connect_and_error() {
        assert_eq!(
            decode(r#"40{"sid":"s1"}"#).unwrap(),
            Frame::Connect { namespace: "/".into(), data: Some(json!({"sid": "s1"})) }
        );
        assert_eq!(
            decode(r#"44{"message":"Not authorized"}"#).unwrap(),
            Frame::ConnectError { namespace: "/".into(), message: "Not authorized".into() }
        );
    }

    #[test]
    fn test_bad_frames() {
        assert_eq!(decode(""), Err(PacketError::Empty));
        assert_eq!(decode("9"), Err(PacketError::UnknownType('9')));
        assert!(matches!(decode("42{}"), Err(PacketError::Payload(_))));
        assert!(matches!(decode("42[]"), Err(PacketError::Payload(_))));
        assert_eq!(decode("43[1]").unwrap(), Frame::Unsupported('3'));
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode_connect(None), "40");
        assert_eq!(encode_connect(Some(&json!({"token": "t"}))), r#"40{"token":"t"}"#);
        assert_eq!(encode_event("join", &[json!("mgr-1")]), r#"42["join","mgr-1"]"#);
    }
}
