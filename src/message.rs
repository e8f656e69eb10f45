// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands, events and their wire payloads.
//!
//! JSON payloads travel inside a small envelope:
//!
//! ```json
//! {"d": {"distance": 10}, "ts": "2026-01-01T12:00:00.000Z"}
//! ```
//!
//! [`encode_payload`] produces the envelope and [`decode_payload`] unwraps it.
//! JSON documents without the envelope are accepted as-is so messages from
//! other publishers still decode.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{DeliveryError, PublishError};
use crate::topic::{MessageClass, MessageFormat, ParsedTopic};
use crate::transport::QoS;

/// Envelope key holding the message data.
const DATA_KEY: &str = "d";

/// Envelope key holding the publish timestamp.
const TIMESTAMP_KEY: &str = "ts";

/// Decoded message data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON document.
    Json(Value),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes (binary or custom formats).
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the JSON document, if this is a JSON payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the text, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a binary payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Fields shared by commands and events.
#[derive(Debug, Clone, PartialEq)]
struct Envelope {
    device_type: String,
    device_id: String,
    name: String,
    format: MessageFormat,
    payload: Payload,
    timestamp: DateTime<Utc>,
}

macro_rules! message_accessors {
    ($ty:ident, $name_doc:literal) => {
        impl $ty {
            /// Returns the device type.
            #[must_use]
            pub fn device_type(&self) -> &str {
                &self.0.device_type
            }

            /// Returns the device id.
            #[must_use]
            pub fn device_id(&self) -> &str {
                &self.0.device_id
            }

            #[doc = $name_doc]
            #[must_use]
            pub fn name(&self) -> &str {
                &self.0.name
            }

            /// Returns the declared payload format.
            #[must_use]
            pub fn format(&self) -> &MessageFormat {
                &self.0.format
            }

            /// Returns the decoded payload.
            #[must_use]
            pub fn payload(&self) -> &Payload {
                &self.0.payload
            }

            /// Returns the publish timestamp, or the arrival time if none was sent.
            #[must_use]
            pub fn timestamp(&self) -> DateTime<Utc> {
                self.0.timestamp
            }
        }
    };
}

/// A command addressed to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command(Envelope);

/// An event reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Event(Envelope);

message_accessors!(Command, "Returns the command name.");
message_accessors!(Event, "Returns the event name.");

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Command [{}:{}] {} ({})",
            self.0.device_type, self.0.device_id, self.0.name, self.0.format
        )
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Event [{}:{}] {} ({})",
            self.0.device_type, self.0.device_id, self.0.name, self.0.format
        )
    }
}

/// A decoded inbound message handed to the registered callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A device command.
    Command(Command),
    /// A device event.
    Event(Event),
}

impl Message {
    /// Decodes a raw inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::DecodeFailed`] if the topic is not a command
    /// or event topic, or the payload does not match its declared format.
    pub fn decode(inbound: &InboundMessage) -> Result<Self, DeliveryError> {
        let decode_failed = |reason: String| DeliveryError::DecodeFailed {
            topic: inbound.topic.clone(),
            reason,
        };

        let parsed = ParsedTopic::parse(&inbound.topic)
            .ok_or_else(|| decode_failed("not a device command or event topic".to_string()))?;
        let (payload, timestamp) =
            decode_payload(&parsed.format, &inbound.payload, inbound.received_at)
                .map_err(decode_failed)?;

        let envelope = Envelope {
            device_type: parsed.device_type.to_string(),
            device_id: parsed.device_id.to_string(),
            name: parsed.name.to_string(),
            format: parsed.format,
            payload,
            timestamp,
        };

        Ok(match parsed.class {
            MessageClass::Command => Self::Command(Command(envelope)),
            MessageClass::Event => Self::Event(Event(envelope)),
        })
    }

    /// Returns the command, if this message is one.
    #[must_use]
    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Self::Command(command) => Some(command),
            Self::Event(_) => None,
        }
    }

    /// Returns the event, if this message is one.
    #[must_use]
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Command(_) => None,
        }
    }
}

/// A raw message as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The topic the message arrived on.
    pub topic: String,
    /// Undecoded payload bytes.
    pub payload: Vec<u8>,
    /// Per-client sequence number assigned on arrival.
    pub arrival_sequence: u64,
    /// Wall-clock arrival time.
    pub received_at: DateTime<Utc>,
}

/// A message ready for transmission. Not retained after the transport accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// The full topic.
    pub topic: String,
    /// Declared format (also encoded in the topic).
    pub format: MessageFormat,
    /// Encoded payload bytes.
    pub payload: Vec<u8>,
    /// Delivery guarantee requested from the transport.
    pub qos: QoS,
}

/// Serializes `data` for transmission in `format`.
///
/// - JSON: wrapped as `{"d": data, "ts": timestamp}`.
/// - Text: `data` must serialize to a JSON string.
/// - Binary and custom formats: `data` must serialize to a string or a byte array.
///
/// # Errors
///
/// Returns [`PublishError::SerializationFailed`] if `data` cannot be
/// represented in `format`.
pub fn encode_payload<T>(
    data: &T,
    format: &MessageFormat,
    timestamp: DateTime<Utc>,
) -> Result<Vec<u8>, PublishError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(data)
        .map_err(|e| PublishError::SerializationFailed(e.to_string()))?;

    match format {
        MessageFormat::Json => {
            let mut envelope = serde_json::Map::new();
            envelope.insert(DATA_KEY.to_string(), value);
            envelope.insert(
                TIMESTAMP_KEY.to_string(),
                Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            serde_json::to_vec(&Value::Object(envelope))
                .map_err(|e| PublishError::SerializationFailed(e.to_string()))
        }
        MessageFormat::Text => match value {
            Value::String(text) => Ok(text.into_bytes()),
            other => Err(PublishError::SerializationFailed(format!(
                "text payload must be a string, got {}",
                json_kind(&other)
            ))),
        },
        MessageFormat::Binary | MessageFormat::Custom(_) => match value {
            Value::String(text) => Ok(text.into_bytes()),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| {
                            PublishError::SerializationFailed(format!(
                                "{format} payload arrays must contain bytes, got {item}"
                            ))
                        })
                })
                .collect(),
            other => Err(PublishError::SerializationFailed(format!(
                "{format} payload must be a string or byte array, got {}",
                json_kind(&other)
            ))),
        },
    }
}

/// Decodes payload bytes declared as `format`.
///
/// Returns the payload together with the envelope timestamp, falling back
/// to `received_at` when the message carries none.
///
/// # Errors
///
/// Returns a description of the failure if the bytes are not valid for `format`.
pub fn decode_payload(
    format: &MessageFormat,
    bytes: &[u8],
    received_at: DateTime<Utc>,
) -> Result<(Payload, DateTime<Utc>), String> {
    match format {
        MessageFormat::Json => {
            let value: Value =
                serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
            Ok(unwrap_envelope(value, received_at))
        }
        MessageFormat::Text => String::from_utf8(bytes.to_vec())
            .map(|text| (Payload::Text(text), received_at))
            .map_err(|e| format!("invalid UTF-8 text: {e}")),
        MessageFormat::Binary | MessageFormat::Custom(_) => {
            Ok((Payload::Binary(bytes.to_vec()), received_at))
        }
    }
}

fn unwrap_envelope(value: Value, received_at: DateTime<Utc>) -> (Payload, DateTime<Utc>) {
    match value {
        Value::Object(mut obj)
            if obj.contains_key(DATA_KEY)
                && obj.keys().all(|k| k == DATA_KEY || k == TIMESTAMP_KEY) =>
        {
            let timestamp = obj
                .get(TIMESTAMP_KEY)
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map_or(received_at, |ts| ts.with_timezone(&Utc));
            let data = obj.remove(DATA_KEY).unwrap_or(Value::Null);
            (Payload::Json(data), timestamp)
        }
        other => (Payload::Json(other), received_at),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    fn inbound(topic: &str, payload: &[u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            arrival_sequence: 1,
            received_at: fixed_time(),
        }
    }

    #[test]
    fn json_payload_is_wrapped_in_envelope() {
        let bytes = encode_payload(&json!({"distance": 10}), &MessageFormat::Json, fixed_time())
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["d"], json!({"distance": 10}));
        assert_eq!(value["ts"], "2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn envelope_unwraps_with_timestamp() {
        let bytes = br#"{"d":{"distance":10},"ts":"2025-05-05T05:05:05Z"}"#;
        let (payload, ts) = decode_payload(&MessageFormat::Json, bytes, fixed_time()).unwrap();
        assert_eq!(payload, Payload::Json(json!({"distance": 10})));
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 5, 5, 5, 5, 5).unwrap());
    }

    #[test]
    fn plain_json_passes_through() {
        let bytes = br#"{"d":1,"other":2}"#;
        let (payload, ts) = decode_payload(&MessageFormat::Json, bytes, fixed_time()).unwrap();
        assert_eq!(payload, Payload::Json(json!({"d": 1, "other": 2})));
        assert_eq!(ts, fixed_time());
    }

    #[test]
    fn text_requires_string() {
        let bytes = encode_payload("hello", &MessageFormat::Text, fixed_time()).unwrap();
        assert_eq!(bytes, b"hello");

        let err = encode_payload(&json!({"a": 1}), &MessageFormat::Text, fixed_time()).unwrap_err();
        assert!(matches!(err, PublishError::SerializationFailed(msg) if msg.contains("object")));
    }

    #[test]
    fn binary_accepts_byte_arrays_only() {
        let bytes = encode_payload(&vec![1u8, 2, 255], &MessageFormat::Binary, fixed_time())
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 255]);

        let err = encode_payload(&vec![1, 256], &MessageFormat::Binary, fixed_time()).unwrap_err();
        assert!(matches!(err, PublishError::SerializationFailed(_)));
    }

    #[test]
    fn unserializable_map_keys_fail() {
        use std::collections::HashMap;
        let mut data = HashMap::new();
        data.insert(vec![1u8], 1);
        let err = encode_payload(&data, &MessageFormat::Json, fixed_time()).unwrap_err();
        assert!(matches!(err, PublishError::SerializationFailed(_)));
    }

    #[test]
    fn decode_command_message() {
        let msg = Message::decode(&inbound(
            "iot-2/type/T/id/D/cmd/run/fmt/json",
            br#"{"d":{"distance":10}}"#,
        ))
        .unwrap();
        let command = msg.as_command().unwrap();
        assert_eq!(command.device_type(), "T");
        assert_eq!(command.device_id(), "D");
        assert_eq!(command.name(), "run");
        assert_eq!(command.payload().as_json(), Some(&json!({"distance": 10})));
        assert_eq!(command.timestamp(), fixed_time());
        assert!(msg.as_event().is_none());
    }

    #[test]
    fn decode_event_text_message() {
        let msg = Message::decode(&inbound("iot-2/type/T/id/D/evt/status/fmt/text", b"ok")).unwrap();
        let event = msg.as_event().unwrap();
        assert_eq!(event.payload().as_text(), Some("ok"));
        assert_eq!(event.to_string(), "Event [T:D] status (text)");
    }

    #[test]
    fn decode_rejects_bad_topic_and_payload() {
        let err = Message::decode(&inbound("stat/x/RESULT", b"{}")).unwrap_err();
        assert!(matches!(err, DeliveryError::DecodeFailed { .. }));

        let err =
            Message::decode(&inbound("iot-2/type/T/id/D/cmd/run/fmt/json", b"{not json"))
                .unwrap_err();
        assert!(matches!(err, DeliveryError::DecodeFailed { reason, .. } if reason.contains("JSON")));

        let err = Message::decode(&inbound("iot-2/type/T/id/D/cmd/run/fmt/text", &[0xff, 0xfe]))
            .unwrap_err();
        assert!(matches!(err, DeliveryError::DecodeFailed { .. }));
    }

    #[test]
    fn custom_format_passes_bytes_through() {
        let msg =
            Message::decode(&inbound("iot-2/type/T/id/D/evt/raw/fmt/cbor", &[1, 2, 3])).unwrap();
        assert_eq!(msg.as_event().unwrap().payload().as_bytes(), Some(&[1u8, 2, 3][..]));
    }
}
