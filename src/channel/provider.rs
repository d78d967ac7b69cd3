use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::base::{ChannelActions, ChannelBase};
use super::endpoint::{ChannelEndpoint, DisconnectHook};
use crate::error::{ChannelError, Result};
use crate::identity::{Identity, ProviderIdentity};
use crate::message::types::{actions, SendChannelMessage};
use crate::transport::Wire;

type ConnectionListener = Arc<dyn Fn(Identity, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type ClientDisconnectListener = Arc<dyn Fn(&Identity) + Send + Sync>;

struct ProviderInner {
    identity: ProviderIdentity,
    wire: Arc<dyn Wire>,
    base: ChannelBase,
    connections: RwLock<Vec<Identity>>,
    connection_listener: RwLock<Option<ConnectionListener>>,
    disconnect_listener: RwLock<Option<ClientDisconnectListener>>,
    hook: DisconnectHook,
    destroyed: AtomicBool,
}

/// The channel owner side. Accepts client connections and serves actions.
#[derive(Clone)]
pub struct ChannelProvider {
    inner: Arc<ProviderInner>,
}

impl ChannelProvider {
    pub(crate) fn new(identity: ProviderIdentity, wire: Arc<dyn Wire>, hook: DisconnectHook) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                identity,
                wire,
                base: ChannelBase::new(),
                connections: RwLock::new(Vec::new()),
                connection_listener: RwLock::new(None),
                disconnect_listener: RwLock::new(None),
                hook,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &ProviderIdentity {
        &self.inner.identity
    }

    pub fn channel_name(&self) -> &str {
        &self.inner.identity.channel_name
    }

    /// Clients currently connected, in connection order.
    pub fn connections(&self) -> Vec<Identity> {
        self.inner.connections.read().clone()
    }

    pub fn is_connected(&self, client: &Identity) -> bool {
        self.inner.connections.read().contains(client)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Validate incoming connections. An error rejects the client with its
    /// message; a value is returned to the client.
    pub fn on_connection<F, Fut>(&self, listener: F)
    where
        F: Fn(Identity, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let listener: ConnectionListener = Arc::new(move |identity, payload| listener(identity, payload).boxed());
        *self.inner.connection_listener.write() = Some(listener);
    }

    pub fn on_disconnection<F>(&self, listener: F)
    where
        F: Fn(&Identity) + Send + Sync + 'static,
    {
        *self.inner.disconnect_listener.write() = Some(Arc::new(listener));
    }

    /// Handle a client's connection request.
    pub async fn process_connection(&self, client: Identity, payload: Value) -> Result<Value> {
        let listener = self.inner.connection_listener.read().clone();
        let result = match listener {
            Some(listener) => listener(client.clone(), payload).await?,
            None => Value::Null,
        };

        let mut connections = self.inner.connections.write();
        if !connections.contains(&client) {
            connections.push(client.clone());
        }
        drop(connections);

        info!(
            channel = %self.channel_name(),
            client = %client.uuid,
            "Client connected"
        );
        Ok(result)
    }

    pub async fn process_action(&self, action: &str, payload: Value, sender: Identity) -> Result<Value> {
        self.inner.base.process_action(action, payload, sender).await
    }

    /// Send `action` to one connected client and wait for its result.
    pub async fn dispatch(&self, to: &Identity, action: &str, payload: Value) -> Result<Value> {
        if !self.is_connected(to) {
            return Err(ChannelError::NotConnected(format!(
                "Client connection with identity {to} no longer connected."
            )));
        }
        let message = SendChannelMessage {
            provider_identity: self.inner.identity.clone(),
            destination_identity: Some(to.clone()),
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

    /// Send `action` to every connected client. Results are in connection
    /// order.
    pub async fn publish(&self, action: &str, payload: Value) -> Vec<Result<Value>> {
        let connections = self.connections();
        join_all(
            connections
                .iter()
                .map(|client| self.dispatch(client, action, payload.clone())),
        )
        .await
    }

    /// Tear the channel down at the runtime and leave the registry.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self
            .inner
            .wire
            .send_action(
                actions::DESTROY_CHANNEL,
                json!({ "channelName": self.channel_name() }),
            )
            .await;
        self.inner.connections.write().clear();
        self.inner.hook.detach(&ChannelEndpoint::Provider(self.clone()));
        debug!(channel = %self.channel_name(), "Channel destroyed");
        result?;
        Ok(())
    }

    /// A client left; drop it from the connection list.
    pub(crate) fn notify_client_disconnected(&self, client: &Identity) {
        let removed = {
            let mut connections = self.inner.connections.write();
            let before = connections.len();
            connections.retain(|c| c.uuid != client.uuid || c.name != client.name);
            connections.len() != before
        };
        if removed {
            info!(
                channel = %self.channel_name(),
                client = %client.uuid,
                "Client disconnected"
            );
        }
        let listener = self.inner.disconnect_listener.read().clone();
        if let Some(listener) = listener {
            listener(client);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &ChannelProvider) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ChannelActions for ChannelProvider {
    fn base(&self) -> &ChannelBase {
        &self.inner.base
    }
}

impl fmt::Debug for ChannelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProvider")
            .field("identity", &self.inner.identity)
            .field("connections", &self.inner.connections.read().len())
            .finish()
    }
}
