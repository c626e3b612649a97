//! Relay wire protocol types (NIP-01).

use serde_json::Value;

use crate::types::nostr::{Event, Filter};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle of one subscription over one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Subscribed,
    Streaming,
    EoseReceived,
    Closed,
    Failed,
}

/// A parsed relay-to-client frame.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a `["EVENT", ...]` style JSON array frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RelayError::Parse(e.to_string()))?;
        let arr = value
            .as_array()
            .ok_or_else(|| RelayError::Parse("frame is not an array".into()))?;
        let kind = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Parse("missing frame kind".into()))?;

        let str_at = |i: usize| -> Result<String, RelayError> {
            arr.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RelayError::Parse(format!("missing string at index {i}")))
        };

        match kind {
            "EVENT" => {
                let event_value = arr
                    .get(2)
                    .ok_or_else(|| RelayError::Parse("missing event payload".into()))?;
                let event: Event = serde_json::from_value(event_value.clone())
                    .map_err(|e| RelayError::Parse(format!("bad event: {e}")))?;
                Ok(RelayMessage::Event {
                    sub_id: str_at(1)?,
                    event,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose { sub_id: str_at(1)? }),
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                sub_id: str_at(1)?,
                message: arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice { message: str_at(1)? }),
            other => Err(RelayError::Parse(format!("unknown frame kind: {other}"))),
        }
    }
}

/// Client-to-relay frame construction.
pub struct ClientMessage;

impl ClientMessage {
    pub fn req(sub_id: &str, filter: &Filter) -> Result<String, RelayError> {
        Ok(serde_json::to_string(&serde_json::json!([
            "REQ", sub_id, filter
        ]))?)
    }

    pub fn close(sub_id: &str) -> Result<String, RelayError> {
        Ok(serde_json::to_string(&serde_json::json!(["CLOSE", sub_id]))?)
    }

    pub fn event(event: &Event) -> Result<String, RelayError> {
        Ok(serde_json::to_string(&serde_json::json!(["EVENT", event]))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::nostr::{kinds, EventTemplate, Keys};

    #[test]
    fn parses_event_frame() {
        let keys = Keys::generate().unwrap();
        let event =
            Event::from_template(EventTemplate::new(kinds::TEXT_NOTE, "hi", vec![]), &keys)
                .unwrap();
        let frame = format!(r#"["EVENT","sub-1",{}]"#, event.as_json().unwrap());

        match RelayMessage::parse(&frame).unwrap() {
            RelayMessage::Event { sub_id, event: parsed } => {
                assert_eq!(sub_id, "sub-1");
                assert_eq!(parsed, event);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_control_frames() {
        assert!(matches!(
            RelayMessage::parse(r#"["EOSE","sub-1"]"#).unwrap(),
            RelayMessage::Eose { .. }
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["OK","abcd",true,""]"#).unwrap(),
            RelayMessage::Ok { accepted: true, .. }
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["CLOSED","sub-1","rate limited"]"#).unwrap(),
            RelayMessage::Closed { .. }
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice { .. }
        ));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(RelayMessage::parse("not json").is_err());
        assert!(RelayMessage::parse(r#"{"not":"array"}"#).is_err());
        assert!(RelayMessage::parse(r#"["WHAT","sub-1"]"#).is_err());
    }

    #[test]
    fn builds_req_frame() {
        let filter = Filter::new().kinds([kinds::NOSTR_CONNECT]).limit(1);
        let frame = ClientMessage::req("sub-9", &filter).unwrap();
        assert!(frame.starts_with(r#"["REQ","sub-9","#));
        assert!(frame.contains("24133"));
    }
}
