pub mod types;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use self::types::{actions, AckPayload, MessageId, MAX_MESSAGE_SIZE};
use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, TransportError, TransportResult};

/// Envelope for everything exchanged with the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub action: String,
    #[serde(default)]
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            message_id: MessageId::new(),
            correlation_id: None,
            payload,
        }
    }

    /// Build a request whose payload is any serializable value.
    pub fn request<T: Serialize>(action: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(action, serde_json::to_value(payload)?))
    }

    /// Reply to `correlation_id` with an acknowledgement payload.
    pub fn ack(correlation_id: MessageId, ack: AckPayload) -> Self {
        // AckPayload only holds strings, bools and JSON values
        let payload = serde_json::to_value(ack).unwrap_or(Value::Null);
        Self {
            action: actions::ACK.to_string(),
            message_id: MessageId::new(),
            correlation_id: Some(correlation_id),
            payload,
        }
    }

    pub fn nack(correlation_id: MessageId, reason: impl Into<String>) -> Self {
        Self::ack(correlation_id, AckPayload::failure(reason))
    }

    pub fn is_ack(&self) -> bool {
        self.action == actions::ACK && self.correlation_id.is_some()
    }

    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Encode message to frame bytes
    pub fn encode(&self) -> TransportResult<Bytes> {
        self.encode_with(&JsonCodec)
    }

    pub fn encode_with<C: Codec>(&self, codec: &C) -> TransportResult<Bytes> {
        let bytes = codec
            .encode(self)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(Bytes::from(bytes))
    }

    /// Decode message from frame bytes
    pub fn decode(buf: &[u8]) -> TransportResult<Self> {
        Self::decode_with(&JsonCodec, buf)
    }

    pub fn decode_with<C: Codec>(codec: &C, buf: &[u8]) -> TransportResult<Self> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        codec
            .decode(buf)
            .map_err(|e| TransportError::Protocol(format!("Invalid message: {}", e)))
    }
}

/// Build the acknowledgement template the runtime attaches to channel pushes.
pub fn ack_template(correlation_id: MessageId) -> Value {
    json!({
        "action": actions::ACK,
        "messageId": MessageId::new(),
        "correlationId": correlation_id,
        "payload": { "success": true, "payload": {} }
    })
}

/// Store a handler result at `payload.payload.result`.
pub fn fill_ack_result(ack: &mut Value, result: Value) {
    let inner = ack_payload_mut(ack)
        .entry("payload")
        .or_insert_with(|| Value::Object(Map::new()));
    if !inner.is_object() {
        *inner = Value::Object(Map::new());
    }
    if let Value::Object(map) = inner {
        map.insert("result".to_string(), result);
    }
}

/// Mark an acknowledgement as failed with a human readable reason.
pub fn fill_ack_failure(ack: &mut Value, reason: impl Into<String>) {
    let payload = ack_payload_mut(ack);
    payload.insert("success".to_string(), Value::Bool(false));
    payload.insert("reason".to_string(), Value::String(reason.into()));
}

fn ack_payload_mut(ack: &mut Value) -> &mut Map<String, Value> {
    if !ack.is_object() {
        *ack = Value::Object(Map::new());
    }
    let Value::Object(outer) = ack else {
        unreachable!("ack was just made an object")
    };
    let payload = outer
        .entry("payload")
        .or_insert_with(|| Value::Object(Map::new()));
    if !payload.is_object() {
        *payload = Value::Object(Map::new());
    }
    match payload {
        Value::Object(map) => map,
        _ => unreachable!("payload was just made an object"),
    }
}
