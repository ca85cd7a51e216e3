//! JSON encoding of the message envelope.
//!
//! Decoding inspects the `type` tag before the typed parse so an unknown
//! kind is reported as [`RelayError::UnsupportedMessageType`] rather than a
//! generic parse failure.

use crate::error::{RelayError, RelayResult};
use crate::messages::{Message, MsgKind};
use serde_json::Value;

/// Encode a message as a JSON byte buffer.
pub fn encode_message(msg: &Message) -> RelayResult<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a JSON byte buffer into a message.
pub fn decode_message(data: &[u8]) -> RelayResult<Message> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| RelayError::InvalidMessage(format!("not a JSON object: {e}")))?;

    let tag = match value.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(other) => {
            return Err(RelayError::InvalidMessage(format!(
                "type must be a string, got {other}"
            )))
        }
        None => return Err(RelayError::InvalidMessage("missing type".into())),
    };

    if MsgKind::parse(tag).is_none() {
        return Err(RelayError::UnsupportedMessageType(tag.to_string()));
    }

    serde_json::from_value(value).map_err(|e| RelayError::InvalidMessage(e.to_string()))
}

/// Bytes pushed to a connection for a business payload.
pub fn encode_payload(payload: &Value) -> RelayResult<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_subscribe() {
        let msg = decode_message(br#"{"type":"Subscribe","subjects":["orders","x"]}"#).unwrap();
        match msg {
            Message::Subscribe(p) => assert_eq!(p.all(), vec!["orders", "x"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_response_keeps_payload() {
        let msg = decode_message(
            br#"{"type":"Response","inbox":"abc123","connection_id":"c1","payload":{"ok":true}}"#,
        )
        .unwrap();
        assert_eq!(msg, Message::response("c1", "abc123", json!({"ok": true})));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let err = decode_message(br#"{"type":"Ping"}"#).unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedMessageType(t) if t == "Ping"));
    }

    #[test]
    fn missing_fields_are_invalid() {
        let err = decode_message(br#"{"type":"Request","uri":"a.b"}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            decode_message(b"not json").unwrap_err(),
            RelayError::InvalidMessage(_)
        ));
        assert!(matches!(
            decode_message(br#"{"subject":"x"}"#).unwrap_err(),
            RelayError::InvalidMessage(_)
        ));
    }

    #[test]
    fn payload_bytes_are_plain_json() {
        assert_eq!(encode_payload(&json!({"id": 1})).unwrap(), br#"{"id":1}"#);
    }
}
