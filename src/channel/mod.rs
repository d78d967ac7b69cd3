//! Channels: named, runtime-mediated request/response paths between a
//! provider application and any number of client applications.

mod base;
mod client;
mod endpoint;
mod pending;
mod provider;

#[cfg(test)]
pub(crate) mod testing;

pub use base::{
    ActionHandler, ChannelActions, ChannelBase, DefaultActionHandler, ErrorMiddleware, FnHandler,
    Middleware, TypedHandler,
};
pub use client::ChannelClient;
pub use endpoint::ChannelEndpoint;
pub use provider::ChannelProvider;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::error::{ChannelError, Result};
use crate::events::{ChannelEvent, ChannelEventKind, EventEmitter, ListenerId};
use crate::identity::{Identity, ProviderIdentity};
use crate::message::types::{actions, AckPayload, ChannelActionPayload, ConnectRequest, DesktopEvent};
use crate::message::{fill_ack_failure, fill_ack_result, Message};
use crate::transport::Wire;
use endpoint::DisconnectHook;
use pending::{PendingConnects, PendingSetups};

/// Options for [`ChannelRegistry::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Keep waiting for the channel to be created instead of failing.
    pub wait: bool,
    /// Handed to the provider's connection listener.
    pub payload: Option<Value>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            wait: true,
            payload: None,
        }
    }
}

/// Endpoints by channel id: one provider, or every client handle in
/// connect order.
type ChannelMap = Arc<RwLock<HashMap<String, Vec<ChannelEndpoint>>>>;

/// Per-application registry of channel endpoints, bound to one runtime
/// connection.
pub struct ChannelRegistry {
    wire: Arc<dyn Wire>,
    channels: ChannelMap,
    pending: PendingConnects,
    creating: PendingSetups,
    joining: PendingSetups,
    events: EventEmitter,
    inbound: mpsc::UnboundedSender<Message>,
}

impl ChannelRegistry {
    /// Create a registry and hook it into `wire`'s pushed-message stream.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(wire: Arc<dyn Wire>) -> Arc<Self> {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            wire,
            channels: Arc::new(RwLock::new(HashMap::new())),
            pending: PendingConnects::new(),
            creating: PendingSetups::new(),
            joining: PendingSetups::new(),
            events: EventEmitter::default(),
            inbound,
        });

        let weak = Arc::downgrade(&registry);
        registry.wire.register_message_handler(Arc::new(move |message: &Message| {
            weak.upgrade()
                .map_or(false, |registry| registry.on_message(message))
        }));
        let weak = Arc::downgrade(&registry);
        registry.wire.register_message_handler(Arc::new(move |message: &Message| {
            weak.upgrade()
                .map_or(false, |registry| registry.on_desktop_event(message))
        }));

        tokio::spawn(route_channel_actions(Arc::downgrade(&registry), inbound_rx));
        registry
    }

    pub fn me(&self) -> &Identity {
        self.wire.me()
    }

    /// Every channel currently provided on the runtime.
    pub async fn get_all_channels(&self) -> Result<Vec<ProviderIdentity>> {
        let ack = self
            .wire
            .send_action(actions::GET_ALL_CHANNELS, Value::Null)
            .await?;
        ack_data(ack)
    }

    /// Create a channel provided by this application.
    pub async fn create(&self, channel_name: &str) -> Result<ChannelProvider> {
        if channel_name.is_empty() {
            return Err(ChannelError::InvalidChannelName("create"));
        }
        let _setup = self.creating.begin(channel_name);
        let ack = self
            .wire
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": channel_name }))
            .await?;
        let identity: ProviderIdentity = ack_data(ack)?;

        let provider = ChannelProvider::new(identity, self.wire.clone(), self.disconnect_hook());
        self.insert(ChannelEndpoint::Provider(provider.clone()));
        debug!(
            channel = %channel_name,
            channel_id = %provider.identity().channel_id,
            "Channel created"
        );
        Ok(provider)
    }

    /// Connect to the channel named `channel_name`.
    ///
    /// With `wait` set, an absent channel parks the call until a channel with
    /// that name is created, then the connection is retried. Dropping the
    /// returned future cancels the wait.
    pub async fn connect(&self, channel_name: &str, options: ConnectOptions) -> Result<ChannelClient> {
        if channel_name.is_empty() {
            return Err(ChannelError::InvalidChannelName("connect"));
        }
        if self.provides(channel_name) {
            return Err(ChannelError::OwnChannel(channel_name.to_string()));
        }
        let request = serde_json::to_value(ConnectRequest {
            channel_name: channel_name.to_string(),
            wait: options.wait,
            payload: options.payload.clone(),
        })?;

        loop {
            let waiter = options.wait.then(|| self.pending.register(channel_name));
            let setup = self.joining.begin(channel_name);

            match self
                .wire
                .send_action(actions::CONNECT_TO_CHANNEL, request.clone())
                .await
            {
                Ok(ack) => {
                    drop(waiter);
                    let identity: ProviderIdentity = ack_data(ack)?;
                    let client = ChannelClient::new(identity, self.wire.clone(), self.disconnect_hook());
                    if !self.insert(ChannelEndpoint::Client(client.clone())) {
                        drop(setup);
                        let leave = json!({
                            "channelName": channel_name,
                            "channelId": client.provider_identity().channel_id,
                        });
                        if let Err(e) = self.wire.send_action(actions::DISCONNECT_FROM_CHANNEL, leave).await {
                            warn!(channel = %channel_name, error = %e, "Failed to leave own channel");
                        }
                        return Err(ChannelError::OwnChannel(channel_name.to_string()));
                    }
                    debug!(
                        channel = %channel_name,
                        channel_id = %client.provider_identity().channel_id,
                        "Connected to channel"
                    );
                    return Ok(client);
                }
                Err(err) if err.is_channel_absent() => match waiter {
                    Some(waiter) => {
                        drop(setup);
                        warn!(
                            "Channel not found for channelName: {}, waiting for channel creation.",
                            channel_name
                        );
                        if waiter.wait().await.is_none() {
                            debug!(channel = %channel_name, "Connect waiter dropped, retrying");
                        }
                    }
                    None => {
                        return Err(ChannelError::ChannelNotFound {
                            channel_name: channel_name.to_string(),
                        })
                    }
                },
                Err(err) => return Err(ChannelError::Transport(err)),
            }
        }
    }

    /// Called whenever a channel is created on the runtime.
    pub fn on_channel_connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProviderIdentity) + Send + Sync + 'static,
    {
        self.events.on(
            ChannelEventKind::Connected,
            Arc::new(move |event: &ChannelEvent| {
                if let ChannelEvent::Connected(identity) = event {
                    listener(identity)
                }
            }),
        )
    }

    /// Called whenever a channel is destroyed on the runtime.
    pub fn on_channel_disconnect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProviderIdentity) + Send + Sync + 'static,
    {
        self.events.on(
            ChannelEventKind::Disconnected,
            Arc::new(move |event: &ChannelEvent| {
                if let ChannelEvent::Disconnected(identity) = event {
                    listener(identity)
                }
            }),
        )
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    /// Feed of every channel lifecycle event this registry sees.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Locally held endpoint for `channel_id`. With several client handles
    /// for one channel this is the newest, which receives provider traffic.
    pub fn channel(&self, channel_id: &str) -> Option<ChannelEndpoint> {
        self.channels
            .read()
            .get(channel_id)
            .and_then(|endpoints| endpoints.last())
            .cloned()
    }

    /// Every client handle held for `channel_id`, oldest first.
    pub fn clients(&self, channel_id: &str) -> Vec<ChannelClient> {
        self.channels
            .read()
            .get(channel_id)
            .map(|endpoints| endpoints.iter().filter_map(ChannelEndpoint::as_client).cloned().collect())
            .unwrap_or_default()
    }

    fn provides(&self, channel_name: &str) -> bool {
        self.channels
            .read()
            .values()
            .flatten()
            .filter_map(ChannelEndpoint::as_provider)
            .any(|provider| provider.channel_name() == channel_name)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Claim channel pushes. Returns `false` for anything else.
    pub fn on_message(&self, message: &Message) -> bool {
        match message.action.as_str() {
            actions::PROCESS_CHANNEL_MESSAGE | actions::PROCESS_CHANNEL_CONNECTION => {
                if self.inbound.send(message.clone()).is_err() {
                    warn!(action = %message.action, "Channel router stopped, dropping message");
                }
                true
            }
            _ => false,
        }
    }

    fn on_desktop_event(&self, message: &Message) -> bool {
        if message.action != actions::PROCESS_DESKTOP_EVENT {
            return false;
        }
        let event = message
            .deserialize_payload::<DesktopEvent>()
            .and_then(ChannelEvent::from_desktop_event);
        match event {
            Ok(Some(event)) => {
                self.handle_event(event);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Malformed channel event");
                true
            }
        }
    }

    fn handle_event(&self, event: ChannelEvent) {
        match &event {
            ChannelEvent::Connected(identity) => {
                let woken = self.pending.resolve(identity);
                if woken > 0 {
                    debug!(channel = %identity.channel_name, woken, "Retrying parked connects");
                }
            }
            ChannelEvent::Disconnected(identity) => {
                let mut clients: Vec<ChannelClient> = Vec::new();
                self.channels.write().retain(|_, endpoints| {
                    endpoints.retain(|endpoint| match endpoint {
                        ChannelEndpoint::Client(client)
                            if client.channel_name() == identity.channel_name =>
                        {
                            clients.push(client.clone());
                            false
                        }
                        _ => true,
                    });
                    !endpoints.is_empty()
                });
                for client in clients {
                    client.notify_disconnected(identity);
                }
            }
            ChannelEvent::ClientDisconnected(info) => {
                let providers: Vec<ChannelProvider> = self
                    .channels
                    .read()
                    .values()
                    .flatten()
                    .filter_map(ChannelEndpoint::as_provider)
                    .filter(|provider| provider.channel_name() == info.channel_name)
                    .cloned()
                    .collect();
                let client = info.identity();
                for provider in providers {
                    provider.notify_client_disconnected(&client);
                }
            }
        }
        self.events.emit(&event);
    }

    /// Route one channel push to its endpoint and send exactly one ack.
    async fn process_channel_action(&self, message: Message) {
        let is_connection = message.action == actions::PROCESS_CHANNEL_CONNECTION;
        let body: ChannelActionPayload = match message.deserialize_payload() {
            Ok(body) => body,
            Err(e) => {
                warn!(action = %message.action, error = %e, "Malformed channel push");
                if let Some(mut ack) = message.payload.get("ackToSender").cloned() {
                    fill_ack_failure(&mut ack, e.to_string());
                    self.send_ack(ack).await;
                }
                return;
            }
        };

        let ChannelActionPayload {
            client_identity,
            sender_identity,
            provider_identity,
            action,
            mut ack_to_sender,
            payload,
        } = body;

        // Connection pushes only target providers, so only creates are awaited.
        let mut endpoint = self.channel(&provider_identity.channel_id);
        if endpoint.is_none() {
            let name = &provider_identity.channel_name;
            let created = self.creating.settled(name).await;
            let joined = !is_connection && self.joining.settled(name).await;
            if created || joined {
                endpoint = self.channel(&provider_identity.channel_id);
            }
        }
        let outcome = match endpoint {
            None if is_connection => Err(ChannelError::NotConnected(format!(
                "Channel \"{}\" has been destroyed.",
                provider_identity.channel_name
            ))),
            None => Err(ChannelError::NotConnected(format!(
                "Client connection with identity {} no longer connected.",
                self.wire.me()
            ))),
            Some(endpoint) => {
                let sender = sender_identity
                    .or_else(|| client_identity.clone())
                    .unwrap_or_else(|| provider_identity.owner());
                let dispatch = dispatch_to_endpoint(
                    endpoint,
                    is_connection,
                    client_identity,
                    sender,
                    action.clone(),
                    payload,
                );
                AssertUnwindSafe(dispatch)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ChannelError::Handler(panic_message(panic))))
            }
        };

        match outcome {
            Ok(result) => fill_ack_result(&mut ack_to_sender, result),
            Err(e) => {
                debug!(
                    channel_id = %provider_identity.channel_id,
                    action = %action,
                    error = %e,
                    "Channel action failed"
                );
                fill_ack_failure(&mut ack_to_sender, e.to_string());
            }
        }
        self.send_ack(ack_to_sender).await;
    }

    async fn send_ack(&self, ack: Value) {
        if let Err(e) = self.wire.send_raw(ack).await {
            error!(error = %e, "Failed to send channel acknowledgement");
        }
    }

    /// Store an endpoint. A client is refused for a channel this
    /// application provides.
    fn insert(&self, endpoint: ChannelEndpoint) -> bool {
        let channel_id = endpoint.channel_id().to_string();
        let mut channels = self.channels.write();
        let endpoints = channels.entry(channel_id.clone()).or_default();
        match endpoint {
            ChannelEndpoint::Provider(_) => {
                if !endpoints.is_empty() {
                    debug!(channel_id = %channel_id, replaced = ?endpoints, "Replaced channel endpoints");
                }
                *endpoints = vec![endpoint];
            }
            ChannelEndpoint::Client(_) => {
                if endpoints.iter().any(|e| e.as_provider().is_some()) {
                    return false;
                }
                endpoints.push(endpoint);
            }
        }
        true
    }

    fn disconnect_hook(&self) -> DisconnectHook {
        let channels = Arc::downgrade(&self.channels);
        DisconnectHook::new(move |channel_id, endpoint| {
            let Some(channels) = channels.upgrade() else {
                return 0;
            };
            let mut channels = channels.write();
            let Some(endpoints) = channels.get_mut(channel_id) else {
                return 0;
            };
            endpoints.retain(|current| !current.same_instance(endpoint));
            let remaining = endpoints.len();
            if remaining == 0 {
                channels.remove(channel_id);
            }
            remaining
        })
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("me", self.wire.me())
            .field("channels", &self.channels.read().len())
            .finish()
    }
}

fn dispatch_to_endpoint(
    endpoint: ChannelEndpoint,
    is_connection: bool,
    client_identity: Option<Identity>,
    sender: Identity,
    action: String,
    payload: Value,
) -> BoxFuture<'static, Result<Value>> {
    async move {
        match (is_connection, endpoint) {
            (true, ChannelEndpoint::Provider(provider)) => {
                let client = client_identity.unwrap_or(sender);
                provider.process_connection(client, payload).await
            }
            (true, ChannelEndpoint::Client(client)) => Err(ChannelError::NotConnected(format!(
                "Channel \"{}\" does not accept connections here.",
                client.channel_name()
            ))),
            (false, endpoint) => endpoint.process_action(&action, payload, sender).await,
        }
    }
    .boxed()
}

/// Start channel pushes in arrival order and let them complete concurrently,
/// so a handler may itself wait on channel traffic.
async fn route_channel_actions(registry: Weak<ChannelRegistry>, mut inbound: mpsc::UnboundedReceiver<Message>) {
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else { break };
                let Some(registry) = registry.upgrade() else { break };
                in_flight.push(async move { registry.process_channel_action(message).await }.boxed());
            }
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }
    while in_flight.next().await.is_some() {}
    debug!("Channel router stopped");
}

fn ack_data<T: DeserializeOwned>(ack: AckPayload) -> Result<T> {
    Ok(serde_json::from_value(ack.data.unwrap_or(Value::Null))?)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Channel handler panicked".to_string()
    }
}
