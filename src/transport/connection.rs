use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::identity::Identity;
use crate::message::types::{actions, AckPayload, MessageId};
use crate::message::Message;
use crate::transport::wire::{MessageHandler, Wire};
use crate::transport::FrameTransport;

type PendingTable = Arc<Mutex<HashMap<MessageId, oneshot::Sender<Message>>>>;
type HandlerList = Arc<RwLock<Vec<MessageHandler>>>;

/// Configuration for a connection to the runtime.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for each correlated request (None waits forever)
    pub request_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// An application's multiplexed connection to the runtime.
///
/// One background task reads frames: acknowledgements resolve the matching
/// pending request, everything else is offered to the registered message
/// handlers in order.
pub struct RuntimeConnection<F: FrameTransport> {
    transport: Arc<F>,
    identity: Identity,
    pending: PendingTable,
    handlers: HandlerList,
    config: ConnectionConfig,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: FrameTransport + 'static> RuntimeConnection<F> {
    /// Start reading from `transport` and announce `identity` to the runtime.
    pub async fn open(
        transport: F,
        identity: Identity,
        config: ConnectionConfig,
    ) -> TransportResult<Arc<Self>> {
        let connection = Arc::new(Self {
            transport: Arc::new(transport),
            identity,
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            config,
            reader: Mutex::new(None),
        });

        connection.start();

        let identity = serde_json::to_value(&connection.identity)?;
        connection
            .send_action(actions::REGISTER_IDENTITY, identity)
            .await?;

        Ok(connection)
    }

    fn start(&self) {
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let handlers = self.handlers.clone();
        let name = self.identity.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match transport.recv_frame().await {
                    Ok(frame) => match Message::decode(&frame) {
                        Ok(message) => route_incoming(&pending, &handlers, message),
                        Err(e) => warn!(connection = %name, error = %e, "dropping undecodable frame"),
                    },
                    Err(e) => {
                        debug!(connection = %name, error = %e, "runtime connection reader stopped");
                        break;
                    }
                }
            }

            // Dropping the senders fails every outstanding request.
            pending.lock().clear();
        });

        *self.reader.lock() = Some(handle);
    }

    pub fn transport(&self) -> Arc<F> {
        self.transport.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn close(&self) -> TransportResult<()> {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().clear();
        self.transport.close().await
    }
}

fn route_incoming(pending: &PendingTable, handlers: &HandlerList, message: Message) {
    if message.is_ack() {
        let waiter = message
            .correlation_id
            .and_then(|id| pending.lock().remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!(correlation_id = ?message.correlation_id, "ack for unknown request"),
        }
        return;
    }

    let handlers: Vec<MessageHandler> = handlers.read().clone();
    if !handlers.iter().any(|handler| handler(&message)) {
        debug!(action = %message.action, "no handler claimed pushed message");
    }
}

#[async_trait]
impl<F: FrameTransport + 'static> Wire for RuntimeConnection<F> {
    async fn send_action(&self, action: &str, payload: Value) -> TransportResult<AckPayload> {
        let message = Message::new(action, payload);
        let msg_id = message.message_id;
        let frame = message.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id, tx);

        if let Err(e) = self.transport.send_frame(&frame).await {
            self.pending.lock().remove(&msg_id);
            return Err(e);
        }

        let reply = match self.config.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| {
                self.pending.lock().remove(&msg_id);
                TransportError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                    operation: format!("{} request {}", action, msg_id),
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
            })
        }
    }

    async fn send_raw(&self, message: Value) -> TransportResult<()> {
        let frame = serde_json::to_vec(&message)?;
        self.transport.send_frame(&frame).await
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        self.handlers.write().push(handler);
    }

    fn me(&self) -> &Identity {
        &self.identity
    }
}

impl<F: FrameTransport> Drop for RuntimeConnection<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

impl<F: FrameTransport> Debug for RuntimeConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConnection")
            .field("identity", &self.identity)
            .field("transport", &self.transport.name())
            .field("pending_requests", &self.pending.lock().len())
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{ChannelConfig, ChannelFrameTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answer the identity handshake the way the runtime does.
    async fn accept_identity(runtime_side: &ChannelFrameTransport) -> Identity {
        let frame = runtime_side.recv_frame().await.unwrap();
        let hello = Message::decode(&frame).unwrap();
        assert_eq!(hello.action, actions::REGISTER_IDENTITY);
        let reply = Message::ack(hello.message_id, AckPayload::ok(Value::Null));
        runtime_side.send_frame(&reply.encode().unwrap()).await.unwrap();
        hello.deserialize_payload().unwrap()
    }

    async fn open_pair() -> (
        Arc<RuntimeConnection<ChannelFrameTransport>>,
        ChannelFrameTransport,
    ) {
        let (app_side, runtime_side) =
            ChannelFrameTransport::create_pair("conn", ChannelConfig::default()).unwrap();
        let opening = tokio::spawn(RuntimeConnection::open(
            app_side,
            Identity::new("app", "main"),
            ConnectionConfig::default(),
        ));
        let announced = accept_identity(&runtime_side).await;
        assert_eq!(announced, Identity::new("app", "main"));
        (opening.await.unwrap().unwrap(), runtime_side)
    }

    #[tokio::test]
    async fn test_send_action_resolves_with_ack() {
        let (connection, runtime_side) = open_pair().await;

        let server = tokio::spawn(async move {
            let frame = runtime_side.recv_frame().await.unwrap();
            let request = Message::decode(&frame).unwrap();
            assert_eq!(request.action, actions::GET_ALL_CHANNELS);
            let reply = Message::ack(request.message_id, AckPayload::ok(json!([])));
            runtime_side.send_frame(&reply.encode().unwrap()).await.unwrap();
            runtime_side
        });

        let ack = connection
            .send_action(actions::GET_ALL_CHANNELS, Value::Null)
            .await
            .unwrap();
        assert_eq!(ack.data, Some(json!([])));
        assert_eq!(connection.pending_requests(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_action_nack_carries_reason() {
        let (connection, runtime_side) = open_pair().await;

        let server = tokio::spawn(async move {
            let frame = runtime_side.recv_frame().await.unwrap();
            let request = Message::decode(&frame).unwrap();
            let reply = Message::nack(request.message_id, "internal-nack");
            runtime_side.send_frame(&reply.encode().unwrap()).await.unwrap();
            runtime_side
        });

        let err = connection
            .send_action(actions::CONNECT_TO_CHANNEL, json!({ "channelName": "x" }))
            .await
            .unwrap_err();
        assert!(err.is_channel_absent());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (app_side, runtime_side) =
            ChannelFrameTransport::create_pair("timeout", ChannelConfig::default()).unwrap();
        let opening = tokio::spawn(RuntimeConnection::open(
            app_side,
            Identity::new("app", "main"),
            ConnectionConfig::new().with_request_timeout(Some(Duration::from_millis(50))),
        ));
        accept_identity(&runtime_side).await;
        let connection = opening.await.unwrap().unwrap();

        let err = connection
            .send_action(actions::GET_ALL_CHANNELS, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_pushed_messages_offered_until_claimed() {
        let (connection, runtime_side) = open_pair().await;

        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let (claimed_tx, mut claimed_rx) = tokio::sync::mpsc::unbounded_channel();

        {
            let first_calls = first_calls.clone();
            connection.register_message_handler(Arc::new(move |msg: &Message| {
                first_calls.fetch_add(1, Ordering::SeqCst);
                msg.action == "mine"
            }));
        }
        {
            let second_calls = second_calls.clone();
            connection.register_message_handler(Arc::new(move |msg: &Message| {
                second_calls.fetch_add(1, Ordering::SeqCst);
                let _ = claimed_tx.send(msg.action.clone());
                true
            }));
        }

        let mine = Message::new("mine", Value::Null);
        let theirs = Message::new("theirs", Value::Null);
        runtime_side.send_frame(&mine.encode().unwrap()).await.unwrap();
        runtime_side.send_frame(&theirs.encode().unwrap()).await.unwrap();

        assert_eq!(claimed_rx.recv().await.unwrap(), "theirs");
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_raw_bypasses_correlation() {
        let (connection, runtime_side) = open_pair().await;

        connection
            .send_raw(json!({ "action": "ack", "correlationId": 99, "payload": { "success": true } }))
            .await
            .unwrap();
        assert_eq!(connection.pending_requests(), 0);

        let frame = runtime_side.recv_frame().await.unwrap();
        let raw = Message::decode(&frame).unwrap();
        assert_eq!(raw.correlation_id, Some(MessageId::from_raw(99)));
    }

    #[tokio::test]
    async fn test_closed_runtime_fails_pending_requests() {
        let (connection, runtime_side) = open_pair().await;

        let request = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .send_action(actions::GET_ALL_CHANNELS, Value::Null)
                    .await
            })
        };

        // wait for the request to land, then hang up
        runtime_side.recv_frame().await.unwrap();
        runtime_side.close().await.unwrap();
        drop(runtime_side);

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }
}
