//! Application and channel identities issued by the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one application connection to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uuid: String,
    pub name: String,
}

impl Identity {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{\"uuid\":\"{}\",\"name\":\"{}\"}}", self.uuid, self.name)
    }
}

/// Identity of one provider's channel instance.
///
/// `channel_id` is unique per created channel and is the routing key;
/// `channel_name` is the label clients use for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderIdentity {
    pub channel_id: String,
    pub channel_name: String,
    pub uuid: String,
    pub name: String,
}

impl ProviderIdentity {
    /// The application that owns this channel.
    pub fn owner(&self) -> Identity {
        Identity::new(self.uuid.clone(), self.name.clone())
    }
}

/// A client that left a channel, as reported to that channel's provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDisconnected {
    pub uuid: String,
    pub name: String,
    pub channel_name: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

impl ClientDisconnected {
    pub fn identity(&self) -> Identity {
        Identity::new(self.uuid.clone(), self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_identity_wire_names() {
        let value = json!({
            "channelId": "c-1",
            "channelName": "prices",
            "uuid": "app",
            "name": "main"
        });
        let identity: ProviderIdentity = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(identity.channel_id, "c-1");
        assert_eq!(identity.owner(), Identity::new("app", "main"));
        assert_eq!(serde_json::to_value(&identity).unwrap(), value);
    }

    #[test]
    fn test_identity_display_is_json_like() {
        let identity = Identity::new("app", "win");
        assert_eq!(identity.to_string(), r#"{"uuid":"app","name":"win"}"#);
    }
}
