use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::client::ChannelClient;
use super::provider::ChannelProvider;
use crate::error::Result;
use crate::identity::{Identity, ProviderIdentity};

/// Either side of a channel, as stored in a registry.
#[derive(Clone)]
pub enum ChannelEndpoint {
    Provider(ChannelProvider),
    Client(ChannelClient),
}

impl ChannelEndpoint {
    pub fn provider_identity(&self) -> &ProviderIdentity {
        match self {
            ChannelEndpoint::Provider(provider) => provider.identity(),
            ChannelEndpoint::Client(client) => client.provider_identity(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.provider_identity().channel_id
    }

    pub fn as_provider(&self) -> Option<&ChannelProvider> {
        match self {
            ChannelEndpoint::Provider(provider) => Some(provider),
            ChannelEndpoint::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<&ChannelClient> {
        match self {
            ChannelEndpoint::Client(client) => Some(client),
            ChannelEndpoint::Provider(_) => None,
        }
    }

    /// True when both handles refer to the same endpoint instance.
    pub fn same_instance(&self, other: &ChannelEndpoint) -> bool {
        match (self, other) {
            (ChannelEndpoint::Provider(a), ChannelEndpoint::Provider(b)) => a.ptr_eq(b),
            (ChannelEndpoint::Client(a), ChannelEndpoint::Client(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub async fn process_action(&self, action: &str, payload: Value, sender: Identity) -> Result<Value> {
        match self {
            ChannelEndpoint::Provider(provider) => {
                provider.process_action(action, payload, sender).await
            }
            ChannelEndpoint::Client(client) => client.process_action(action, payload, sender).await,
        }
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEndpoint::Provider(provider) => provider.fmt(f),
            ChannelEndpoint::Client(client) => client.fmt(f),
        }
    }
}

impl From<ChannelProvider> for ChannelEndpoint {
    fn from(provider: ChannelProvider) -> Self {
        ChannelEndpoint::Provider(provider)
    }
}

impl From<ChannelClient> for ChannelEndpoint {
    fn from(client: ChannelClient) -> Self {
        ChannelEndpoint::Client(client)
    }
}

/// Removes an endpoint from its owning registry when it disconnects.
/// Returns how many endpoints the registry still holds for that channel.
#[derive(Clone)]
pub(crate) struct DisconnectHook(Arc<dyn Fn(&str, &ChannelEndpoint) -> usize + Send + Sync>);

impl DisconnectHook {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&str, &ChannelEndpoint) -> usize + Send + Sync + 'static,
    {
        Self(Arc::new(func))
    }

    pub fn detach(&self, endpoint: &ChannelEndpoint) -> usize {
        (self.0)(endpoint.channel_id(), endpoint)
    }
}

impl fmt::Debug for DisconnectHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisconnectHook")
    }
}
