use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::identity::{Identity, ProviderIdentity};

pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn new() -> Self {
        MessageId(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        MessageId(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Action names exchanged with the runtime. These strings are part of the
/// compatibility surface.
pub mod actions {
    pub const ACK: &str = "ack";
    pub const REGISTER_IDENTITY: &str = "register-identity";

    pub const GET_ALL_CHANNELS: &str = "get-all-channels";
    pub const CONNECT_TO_CHANNEL: &str = "connect-to-channel";
    pub const CREATE_CHANNEL: &str = "create-channel";
    pub const SEND_CHANNEL_MESSAGE: &str = "send-channel-message";
    pub const DESTROY_CHANNEL: &str = "destroy-channel";
    pub const DISCONNECT_FROM_CHANNEL: &str = "disconnect-from-channel";

    pub const PROCESS_CHANNEL_MESSAGE: &str = "process-channel-message";
    pub const PROCESS_CHANNEL_CONNECTION: &str = "process-channel-connection";
    pub const PROCESS_DESKTOP_EVENT: &str = "process-desktop-event";
}

/// Payload of an `ack` message.
///
/// Runtime replies carry their result in `data`; acknowledgements produced by
/// a channel endpoint carry it in `payload.result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl AckPayload {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// The handler result carried by an endpoint acknowledgement.
    pub fn result(&self) -> Value {
        self.payload
            .as_ref()
            .and_then(|p| p.get("result"))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Body of `process-channel-connection` and `process-channel-message` pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelActionPayload {
    #[serde(default)]
    pub client_identity: Option<Identity>,
    #[serde(default)]
    pub sender_identity: Option<Identity>,
    pub provider_identity: ProviderIdentity,
    #[serde(default)]
    pub action: String,
    pub ack_to_sender: Value,
    #[serde(default)]
    pub payload: Value,
}

/// Body of `send-channel-message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChannelMessage {
    pub provider_identity: ProviderIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_identity: Option<Identity>,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Body of `connect-to-channel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub channel_name: String,
    pub wait: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Channel lifecycle event pushed under `process-desktop-event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopEvent {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub body: Value,
}

pub const CHANNEL_TOPIC: &str = "channel";
