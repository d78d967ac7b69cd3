//! In-process runtime: the broker side of the channel protocol.
//!
//! Serves any number of application connections over [`FrameTransport`]s,
//! owns the authoritative channel table and relays connection requests and
//! channel messages between providers and clients.

mod channels;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, TransportError, TransportResult};
use crate::events::{event_body, ChannelEvent};
use crate::identity::{ClientDisconnected, Identity, ProviderIdentity};
use crate::message::types::{actions, AckPayload, ConnectRequest, MessageId, SendChannelMessage};
use crate::message::{ack_template, Message};
use crate::transport::channel::{ChannelConfig, ChannelFrameTransport};
use crate::transport::tcp::TcpTransportListener;
use crate::transport::{ConnectionConfig, FrameTransport, RuntimeConnection};
use channels::{ChannelTable, ConnectionId, Departure};

type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Configuration for a [`LocalRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long to wait for a provider or client to acknowledge a relayed
    /// message (None waits forever)
    pub relay_timeout: Option<Duration>,
    /// Transport settings for applications attached in-process
    pub channel: ChannelConfig,
    /// Connection settings for applications attached in-process
    pub connection: ConnectionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            relay_timeout: Some(Duration::from_secs(30)),
            channel: ChannelConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelNameRequest {
    channel_name: String,
}

struct Peer {
    transport: Arc<dyn FrameTransport>,
    identity: RwLock<Option<Identity>>,
}

impl Peer {
    async fn send(&self, message: &Message) -> TransportResult<()> {
        let frame = message.encode()?;
        self.transport.send_frame(&frame).await
    }

    fn identity(&self) -> RuntimeResult<Identity> {
        self.identity
            .read()
            .clone()
            .ok_or(RuntimeError::UnregisteredConnection)
    }
}

struct RuntimeState {
    config: RuntimeConfig,
    peers: RwLock<HashMap<ConnectionId, Arc<Peer>>>,
    channels: Mutex<ChannelTable>,
    relays: Mutex<HashMap<MessageId, (ConnectionId, oneshot::Sender<Message>)>>,
    next_connection: AtomicU64,
}

/// The runtime process, hosted in-process.
#[derive(Clone)]
pub struct LocalRuntime {
    state: Arc<RuntimeState>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            state: Arc::new(RuntimeState {
                config,
                peers: RwLock::new(HashMap::new()),
                channels: Mutex::new(ChannelTable::new()),
                relays: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Serve one application connection until its transport closes.
    pub fn serve<F: FrameTransport + 'static>(&self, transport: F) -> ConnectionHandle {
        let id = self.state.next_connection.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer {
            transport: Arc::new(transport),
            identity: RwLock::new(None),
        });
        self.state.peers.write().insert(id, peer.clone());

        let state = self.state.clone();
        let reader = peer.clone();
        let handle = tokio::spawn(async move {
            loop {
                match reader.transport.recv_frame().await {
                    Ok(frame) => match Message::decode(&frame) {
                        Ok(message) => state.handle(id, &reader, message).await,
                        Err(e) => warn!(connection = id, error = %e, "dropping undecodable frame"),
                    },
                    Err(e) => {
                        debug!(connection = id, error = %e, "runtime connection closed");
                        break;
                    }
                }
            }
            state.disconnect(id).await;
        });

        ConnectionHandle { id, peer, handle }
    }

    /// Accept TCP connections and serve each one.
    pub fn serve_tcp(&self, listener: TcpTransportListener) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(transport) => {
                        runtime.serve(transport);
                    }
                    Err(e) => {
                        warn!(error = %e, "runtime listener stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Attach an application living in this process.
    pub async fn attach(
        &self,
        identity: Identity,
    ) -> TransportResult<Arc<RuntimeConnection<ChannelFrameTransport>>> {
        let (app_side, runtime_side) =
            ChannelFrameTransport::create_pair(identity.uuid.clone(), self.state.config.channel.clone())?;
        self.serve(runtime_side);
        RuntimeConnection::open(app_side, identity, self.state.config.connection.clone()).await
    }

    /// Every channel currently provided.
    pub fn channels(&self) -> Vec<ProviderIdentity> {
        self.state.channels.lock().all()
    }

    pub fn connection_count(&self) -> usize {
        self.state.peers.read().len()
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("connections", &self.state.peers.read().len())
            .field("channels", &self.state.channels.lock().len())
            .finish()
    }
}

/// Handle to one served connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Arc<Peer>,
    handle: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close the connection from the runtime side and wait for its cleanup.
    pub async fn shutdown(self) {
        if let Err(e) = self.peer.transport.close().await {
            debug!(connection = self.id, error = %e, "close failed");
        }
        let _ = self.handle.await;
    }
}

impl RuntimeState {
    async fn handle(self: &Arc<Self>, conn: ConnectionId, peer: &Arc<Peer>, message: Message) {
        if message.is_ack() {
            let waiter = message
                .correlation_id
                .and_then(|id| self.relays.lock().remove(&id));
            match waiter {
                Some((_, tx)) => {
                    let _ = tx.send(message);
                }
                None => debug!(correlation_id = ?message.correlation_id, "ack for unknown relay"),
            }
            return;
        }

        match message.action.as_str() {
            actions::CREATE_CHANNEL | actions::DESTROY_CHANNEL => {
                self.respond_then_announce(conn, peer, &message).await;
            }
            // relayed requests wait on another connection; keep reading meanwhile
            actions::CONNECT_TO_CHANNEL | actions::SEND_CHANNEL_MESSAGE => {
                let state = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let reply = state.respond(conn, &peer, &message).await;
                    reply_to(&peer, message.message_id, reply).await;
                });
            }
            _ => {
                let reply = self.respond(conn, peer, &message).await;
                reply_to(peer, message.message_id, reply).await;
            }
        }
    }

    /// Channel table changes are broadcast after the requester has its reply.
    async fn respond_then_announce(&self, conn: ConnectionId, peer: &Peer, message: &Message) {
        let outcome = if message.action == actions::CREATE_CHANNEL {
            self.create_channel(conn, peer, message)
                .map(|identity| (identity.clone(), ChannelEvent::Connected(identity)))
        } else {
            self.destroy_channel(conn, message)
                .map(|identity| (identity.clone(), ChannelEvent::Disconnected(identity)))
        };

        let (reply, announce) = match outcome {
            Ok((identity, event)) => (
                serde_json::to_value(identity)
                    .map(AckPayload::ok)
                    .map_err(RuntimeError::from),
                Some(event),
            ),
            Err(e) => (Err(e), None),
        };
        reply_to(peer, message.message_id, reply).await;
        if let Some(event) = announce {
            self.broadcast(event).await;
        }
    }

    fn create_channel(&self, conn: ConnectionId, peer: &Peer, message: &Message) -> RuntimeResult<ProviderIdentity> {
        let me = peer.identity()?;
        let request: ChannelNameRequest = parse(message)?;
        let identity = self
            .channels
            .lock()
            .create(&request.channel_name, conn, &me)?;
        info!(
            channel = %identity.channel_name,
            channel_id = %identity.channel_id,
            provider = %me.uuid,
            "channel created"
        );
        Ok(identity)
    }

    fn destroy_channel(&self, conn: ConnectionId, message: &Message) -> RuntimeResult<ProviderIdentity> {
        let request: ChannelNameRequest = parse(message)?;
        let record = self.channels.lock().destroy(&request.channel_name, conn)?;
        info!(channel = %request.channel_name, "channel destroyed");
        Ok(record.identity)
    }

    async fn respond(&self, conn: ConnectionId, peer: &Peer, message: &Message) -> RuntimeResult<AckPayload> {
        if message.action == actions::REGISTER_IDENTITY {
            let identity: Identity = parse(message)?;
            debug!(connection = conn, uuid = %identity.uuid, "identity registered");
            *peer.identity.write() = Some(identity);
            return Ok(AckPayload::ok(Value::Null));
        }

        let me = peer.identity()?;
        match message.action.as_str() {
            actions::GET_ALL_CHANNELS => {
                let all = self.channels.lock().all();
                Ok(AckPayload::ok(serde_json::to_value(all)?))
            }
            actions::CONNECT_TO_CHANNEL => {
                let request: ConnectRequest = parse(message)?;
                let record = self
                    .channels
                    .lock()
                    .by_name(&request.channel_name)
                    .cloned()
                    .ok_or(RuntimeError::ChannelAbsent)?;

                let body = json!({
                    "clientIdentity": me,
                    "senderIdentity": me,
                    "providerIdentity": record.identity,
                    "payload": request.payload.unwrap_or(Value::Null),
                });
                let ack = self
                    .relay(record.provider, actions::PROCESS_CHANNEL_CONNECTION, body)
                    .await?;

                let channel_id = &record.identity.channel_id;
                if !self.channels.lock().add_client(channel_id, conn, &me) {
                    return Err(RuntimeError::ChannelDestroyed(request.channel_name));
                }
                info!(channel = %request.channel_name, client = %me.uuid, "client connected");
                Ok(AckPayload {
                    success: true,
                    data: Some(serde_json::to_value(&record.identity)?),
                    payload: ack.payload,
                    ..Default::default()
                })
            }
            actions::SEND_CHANNEL_MESSAGE => {
                let request: SendChannelMessage = parse(message)?;
                let provider = &request.provider_identity;
                let record = self
                    .channels
                    .lock()
                    .by_id(&provider.channel_id)
                    .cloned()
                    .ok_or_else(|| RuntimeError::ChannelDestroyed(provider.channel_name.clone()))?;

                let (target, client) = match request.destination_identity {
                    None => {
                        if !record.has_client(conn) {
                            return Err(RuntimeError::NotMember(
                                me.to_string(),
                                provider.channel_name.clone(),
                            ));
                        }
                        (record.provider, me.clone())
                    }
                    Some(destination) => {
                        if record.provider != conn {
                            return Err(RuntimeError::NotProvider(provider.channel_name.clone()));
                        }
                        let target = record.client_connection(&destination).ok_or_else(|| {
                            RuntimeError::NotMember(destination.to_string(), provider.channel_name.clone())
                        })?;
                        (target, destination)
                    }
                };

                let body = json!({
                    "clientIdentity": client,
                    "senderIdentity": me,
                    "providerIdentity": record.identity,
                    "action": request.action,
                    "payload": request.payload,
                });
                let ack = self
                    .relay(target, actions::PROCESS_CHANNEL_MESSAGE, body)
                    .await?;
                Ok(AckPayload {
                    success: true,
                    payload: ack.payload,
                    ..Default::default()
                })
            }
            actions::DISCONNECT_FROM_CHANNEL => {
                let request: ChannelNameRequest = parse(message)?;
                let departure = self
                    .channels
                    .lock()
                    .remove_client(&request.channel_name, conn)
                    .ok_or_else(|| RuntimeError::NotMember(me.to_string(), request.channel_name.clone()))?;
                self.notify_departure(departure).await;
                Ok(AckPayload::ok(Value::Null))
            }
            other => Err(RuntimeError::UnknownAction(other.to_string())),
        }
    }

    /// Push `action` to `target` with an acknowledgement template and wait
    /// for the filled-in acknowledgement.
    async fn relay(&self, target: ConnectionId, action: &str, mut body: Value) -> RuntimeResult<AckPayload> {
        let peer = self
            .peers
            .read()
            .get(&target)
            .cloned()
            .ok_or(TransportError::ConnectionClosed)?;

        let correlation = MessageId::new();
        body["ackToSender"] = ack_template(correlation);

        let (tx, rx) = oneshot::channel();
        self.relays.lock().insert(correlation, (target, tx));

        if let Err(e) = peer.send(&Message::new(action, body)).await {
            self.relays.lock().remove(&correlation);
            return Err(e.into());
        }

        let reply = match self.config.relay_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| {
                self.relays.lock().remove(&correlation);
                TransportError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                    operation: format!("{} relay {}", action, correlation),
                }
            })?,
            None => rx.await,
        }
        .map_err(|_| TransportError::ConnectionClosed)?;

        let ack: AckPayload = serde_json::from_value(reply.payload)?;
        if ack.success {
            Ok(ack)
        } else {
            Err(TransportError::Nack {
                reason: ack.reason.unwrap_or_else(|| "Unknown error".to_string()),
            }
            .into())
        }
    }

    async fn broadcast(&self, event: ChannelEvent) {
        let message = match event_body(&event) {
            Ok(body) => Message::new(actions::PROCESS_DESKTOP_EVENT, body),
            Err(e) => {
                warn!(error = %e, "unencodable channel event");
                return;
            }
        };
        let peers: Vec<(ConnectionId, Arc<Peer>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect();
        for (id, peer) in peers {
            if let Err(e) = peer.send(&message).await {
                debug!(connection = id, error = %e, "event delivery failed");
            }
        }
    }

    /// Tell a provider one of its clients left.
    async fn notify_departure(&self, departure: Departure) {
        info!(
            channel = %departure.channel.channel_name,
            client = %departure.client.uuid,
            "client disconnected"
        );
        let peer = self.peers.read().get(&departure.provider).cloned();
        let Some(peer) = peer else {
            return;
        };
        let event = ChannelEvent::ClientDisconnected(ClientDisconnected {
            uuid: departure.client.uuid,
            name: departure.client.name,
            channel_name: departure.channel.channel_name,
            channel_id: Some(departure.channel.channel_id),
        });
        match event_body(&event) {
            Ok(body) => {
                let message = Message::new(actions::PROCESS_DESKTOP_EVENT, body);
                if let Err(e) = peer.send(&message).await {
                    debug!(connection = departure.provider, error = %e, "event delivery failed");
                }
            }
            Err(e) => warn!(error = %e, "unencodable channel event"),
        }
    }

    /// Tear down everything a closed connection took part in.
    async fn disconnect(&self, conn: ConnectionId) {
        self.peers.write().remove(&conn);
        // dropping the senders fails relays waiting on this connection
        self.relays.lock().retain(|_, (target, _)| *target != conn);

        let (destroyed, departures) = self.channels.lock().drop_connection(conn);
        for record in destroyed {
            info!(channel = %record.identity.channel_name, "provider gone, channel destroyed");
            self.broadcast(ChannelEvent::Disconnected(record.identity)).await;
        }
        for departure in departures {
            self.notify_departure(departure).await;
        }
    }
}

async fn reply_to(peer: &Peer, correlation: MessageId, reply: RuntimeResult<AckPayload>) {
    let message = match reply {
        Ok(ack) => Message::ack(correlation, ack),
        Err(e) => {
            debug!(correlation_id = %correlation, reason = %e, "request failed");
            Message::nack(correlation, e.to_string())
        }
    };
    if let Err(e) = peer.send(&message).await {
        debug!(correlation_id = %correlation, error = %e, "reply not delivered");
    }
}

fn parse<T: DeserializeOwned>(message: &Message) -> RuntimeResult<T> {
    serde_json::from_value(message.payload.clone()).map_err(|e| RuntimeError::InvalidPayload {
        action: message.action.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::INTERNAL_NACK;
    use crate::transport::Wire;
    use tokio::sync::mpsc;

    async fn app(runtime: &LocalRuntime, uuid: &str) -> Arc<RuntimeConnection<ChannelFrameTransport>> {
        runtime.attach(Identity::new(uuid, uuid)).await.unwrap()
    }

    /// Collect desktop events pushed to `connection`.
    fn events(connection: &Arc<RuntimeConnection<ChannelFrameTransport>>) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        connection.register_message_handler(Arc::new(move |message: &Message| {
            if message.action == actions::PROCESS_DESKTOP_EVENT {
                let _ = tx.send(message.payload.clone());
                true
            } else {
                false
            }
        }));
        rx
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let runtime = LocalRuntime::new();
        let provider = app(&runtime, "provider").await;

        let ack = provider
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap();
        let identity: ProviderIdentity = serde_json::from_value(ack.data.unwrap()).unwrap();
        assert_eq!(identity.channel_name, "prices");
        assert_eq!(identity.uuid, "provider");

        let ack = provider
            .send_action(actions::GET_ALL_CHANNELS, Value::Null)
            .await
            .unwrap();
        let all: Vec<ProviderIdentity> = serde_json::from_value(ack.data.unwrap()).unwrap();
        assert_eq!(all, vec![identity]);
        assert_eq!(runtime.channels().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_names_rejected() {
        let runtime = LocalRuntime::new();
        let provider = app(&runtime, "provider").await;
        provider
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap();

        let err = provider
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Channel \"prices\" already exists.");

        let err = provider
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": "" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Please provide a channelName to create a channel");
    }

    #[tokio::test]
    async fn test_connect_to_absent_channel_nacks_marker() {
        let runtime = LocalRuntime::new();
        let client = app(&runtime, "client").await;

        let err = client
            .send_action(
                actions::CONNECT_TO_CHANNEL,
                json!({ "channelName": "missing", "wait": false }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), INTERNAL_NACK);
        assert!(err.is_channel_absent());
    }

    #[tokio::test]
    async fn test_unknown_action_nacked() {
        let runtime = LocalRuntime::new();
        let client = app(&runtime, "client").await;
        let err = client
            .send_action("launch-rockets", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown action: launch-rockets");
    }

    #[tokio::test]
    async fn test_only_provider_destroys() {
        let runtime = LocalRuntime::new();
        let provider = app(&runtime, "provider").await;
        let other = app(&runtime, "other").await;
        provider
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap();

        let err = other
            .send_action(actions::DESTROY_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Only the provider may destroy channel \"prices\".");

        provider
            .send_action(actions::DESTROY_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap();
        assert!(runtime.channels().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_events_broadcast() {
        let runtime = LocalRuntime::new();
        let watcher = app(&runtime, "watcher").await;
        let mut feed = events(&watcher);
        let provider = app(&runtime, "provider").await;

        provider
            .send_action(actions::CREATE_CHANNEL, json!({ "channelName": "prices" }))
            .await
            .unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event["type"], "connected");
        assert_eq!(event["channelName"], "prices");

        provider.close().await.unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event["type"], "disconnected");
        assert_eq!(event["channelName"], "prices");
        assert!(runtime.channels().is_empty());
    }

    #[tokio::test]
    async fn test_requests_before_identity_rejected() {
        let runtime = LocalRuntime::new();
        let (app_side, runtime_side) =
            ChannelFrameTransport::create_pair("raw", ChannelConfig::default()).unwrap();
        let _handle = runtime.serve(runtime_side);

        let request = Message::new(actions::GET_ALL_CHANNELS, Value::Null);
        app_side.send_frame(&request.encode().unwrap()).await.unwrap();
        let reply = Message::decode(&app_side.recv_frame().await.unwrap()).unwrap();
        assert_eq!(reply.correlation_id, Some(request.message_id));
        let ack: AckPayload = reply.deserialize_payload().unwrap();
        assert!(!ack.success);
        assert_eq!(
            ack.reason.as_deref(),
            Some("Connection has not registered an identity")
        );
    }

    #[tokio::test]
    async fn test_shutdown_removes_connection() {
        let runtime = LocalRuntime::new();
        let (_app_side, runtime_side) =
            ChannelFrameTransport::create_pair("raw", ChannelConfig::default()).unwrap();
        let handle = runtime.serve(runtime_side);
        assert_eq!(runtime.connection_count(), 1);
        handle.shutdown().await;
        assert_eq!(runtime.connection_count(), 0);
    }
}
