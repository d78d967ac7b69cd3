use parking_lot::RwLock;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::base::{ChannelActions, ChannelBase};
use super::endpoint::{ChannelEndpoint, DisconnectHook};
use crate::error::{ChannelError, Result};
use crate::identity::{Identity, ProviderIdentity};
use crate::message::types::{actions, SendChannelMessage};
use crate::transport::Wire;

type ProviderDisconnectListener = Arc<dyn Fn(&ProviderIdentity) + Send + Sync>;

struct ClientInner {
    provider: ProviderIdentity,
    wire: Arc<dyn Wire>,
    base: ChannelBase,
    disconnect_listener: RwLock<Option<ProviderDisconnectListener>>,
    hook: DisconnectHook,
    connected: AtomicBool,
}

/// A connection to another application's channel.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

impl ChannelClient {
    pub(crate) fn new(provider: ProviderIdentity, wire: Arc<dyn Wire>, hook: DisconnectHook) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                provider,
                wire,
                base: ChannelBase::new(),
                disconnect_listener: RwLock::new(None),
                hook,
                connected: AtomicBool::new(true),
            }),
        }
    }

    pub fn provider_identity(&self) -> &ProviderIdentity {
        &self.inner.provider
    }

    pub fn channel_name(&self) -> &str {
        &self.inner.provider.channel_name
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Called once when the provider side goes away.
    pub fn on_disconnection<F>(&self, listener: F)
    where
        F: Fn(&ProviderIdentity) + Send + Sync + 'static,
    {
        *self.inner.disconnect_listener.write() = Some(Arc::new(listener));
    }

    pub async fn process_action(&self, action: &str, payload: Value, sender: Identity) -> Result<Value> {
        self.inner.base.process_action(action, payload, sender).await
    }

    /// Send `action` to the provider and wait for its result.
    pub async fn dispatch(&self, action: &str, payload: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let message = SendChannelMessage {
            provider_identity: self.inner.provider.clone(),
            destination_identity: None,
            action: action.to_string(),
            payload,
        };
        let ack = self
            .inner
            .wire
            .send_action(actions::SEND_CHANNEL_MESSAGE, serde_json::to_value(message)?)
            .await?;
        Ok(ack.result())
    }

    /// Leave the channel. The client is inert afterwards.
    ///
    /// The runtime membership is only given up with the application's last
    /// handle for this channel.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let remaining = self.inner.hook.detach(&ChannelEndpoint::Client(self.clone()));
        if remaining > 0 {
            debug!(channel = %self.channel_name(), remaining, "Client handle released");
            return Ok(());
        }
        self.inner
            .wire
            .send_action(
                actions::DISCONNECT_FROM_CHANNEL,
                json!({
                    "channelName": self.inner.provider.channel_name,
                    "channelId": self.inner.provider.channel_id,
                }),
            )
            .await?;
        debug!(channel = %self.channel_name(), "Disconnected from channel");
        Ok(())
    }

    /// The provider went away. Fires the disconnect listener at most once.
    pub(crate) fn notify_disconnected(&self, provider: &ProviderIdentity) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(channel = %provider.channel_name, "Provider disconnected");
        let listener = self.inner.disconnect_listener.read().clone();
        if let Some(listener) = listener {
            listener(provider);
        }
    }

    fn not_connected(&self) -> ChannelError {
        ChannelError::NotConnected(format!(
            "Client connection with identity {} no longer connected.",
            self.inner.wire.me()
        ))
    }

    pub(crate) fn ptr_eq(&self, other: &ChannelClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ChannelActions for ChannelClient {
    fn base(&self) -> &ChannelBase {
        &self.inner.base
    }
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("provider", &self.inner.provider)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{provider_identity, MockWire};
    use crate::message::types::AckPayload;
    use std::sync::atomic::AtomicUsize;

    fn client(wire: &Arc<MockWire>) -> ChannelClient {
        ChannelClient::new(
            provider_identity("prices", "provider"),
            wire.clone(),
            DisconnectHook::new(|_, _| 0),
        )
    }

    #[tokio::test]
    async fn test_dispatch_returns_handler_result() {
        let wire = Arc::new(MockWire::new("client"));
        let client = client(&wire);
        wire.reply(
            actions::SEND_CHANNEL_MESSAGE,
            Ok(AckPayload {
                success: true,
                payload: Some(json!({ "result": { "bid": 1.25 } })),
                ..Default::default()
            }),
        );

        let result = client.dispatch("quote", json!("ACME")).await.unwrap();
        assert_eq!(result, json!({ "bid": 1.25 }));

        let (_, body) = &wire.sent()[0];
        assert_eq!(body["providerIdentity"]["channelId"], "prices-provider");
        assert!(body.get("destinationIdentity").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_makes_client_inert() {
        let wire = Arc::new(MockWire::new("client"));
        let detached = Arc::new(AtomicUsize::new(0));
        let client = {
            let detached = detached.clone();
            ChannelClient::new(
                provider_identity("prices", "provider"),
                wire.clone(),
                DisconnectHook::new(move |_, _| {
                    detached.fetch_add(1, Ordering::SeqCst);
                    0
                }),
            )
        };

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(detached.load(Ordering::SeqCst), 1);
        assert_eq!(
            wire.sent_actions(),
            vec![actions::DISCONNECT_FROM_CHANNEL.to_string()]
        );

        let err = client.dispatch("quote", Value::Null).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Client connection with identity {"uuid":"client","name":"client"} no longer connected."#
        );
    }

    #[tokio::test]
    async fn test_disconnect_keeps_membership_for_other_handles() {
        let wire = Arc::new(MockWire::new("client"));
        let client = ChannelClient::new(
            provider_identity("prices", "provider"),
            wire.clone(),
            DisconnectHook::new(|_, _| 1),
        );

        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        assert!(wire.sent().is_empty());
    }

    #[tokio::test]
    async fn test_provider_disconnect_fires_once() {
        let wire = Arc::new(MockWire::new("client"));
        let client = client(&wire);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            client.on_disconnection(move |provider| {
                assert_eq!(provider.channel_name, "prices");
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let identity = provider_identity("prices", "provider");
        client.notify_disconnected(&identity);
        client.notify_disconnected(&identity);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected());
    }
}
