//! Scripted wire used by the channel unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportResult;
use crate::identity::{Identity, ProviderIdentity};
use crate::message::types::AckPayload;
use crate::message::Message;
use crate::transport::{MessageHandler, Wire};

pub(crate) struct MockWire {
    me: Identity,
    sent: Mutex<Vec<(String, Value)>>,
    replies: Mutex<HashMap<String, VecDeque<TransportResult<AckPayload>>>>,
    holds: Mutex<HashMap<String, VecDeque<oneshot::Receiver<()>>>>,
    handlers: Mutex<Vec<MessageHandler>>,
    raw_tx: mpsc::UnboundedSender<Value>,
    raw_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl MockWire {
    pub fn new(uuid: &str) -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Self {
            me: Identity::new(uuid, uuid),
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            raw_tx,
            raw_rx: tokio::sync::Mutex::new(raw_rx),
        }
    }

    /// Queue the reply for the next `send_action(action)`. Unscripted
    /// actions succeed with no data.
    pub fn reply(&self, action: &str, reply: TransportResult<AckPayload>) {
        self.replies
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Hold the reply to the next `send_action(action)` until the returned
    /// sender fires or is dropped.
    pub fn hold(&self, action: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub fn sent_actions(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Offer a pushed message to the registered handlers.
    pub fn push(&self, message: Message) -> bool {
        let handlers = self.handlers.lock().clone();
        handlers.iter().any(|handler| handler(&message))
    }

    /// Next message passed to `send_raw`.
    pub async fn next_raw(&self) -> Value {
        let mut rx = self.raw_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for raw send")
            .expect("raw channel closed")
    }
}

impl fmt::Debug for MockWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockWire").field("me", &self.me).finish()
    }
}

#[async_trait]
impl Wire for MockWire {
    async fn send_action(&self, action: &str, payload: Value) -> TransportResult<AckPayload> {
        self.sent.lock().push((action.to_string(), payload));
        let hold = self.holds.lock().get_mut(action).and_then(VecDeque::pop_front);
        if let Some(hold) = hold {
            let _ = hold.await;
        }
        let scripted = self
            .replies
            .lock()
            .get_mut(action)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(AckPayload::ok(Value::Null)))
    }

    async fn send_raw(&self, message: Value) -> TransportResult<()> {
        let _ = self.raw_tx.send(message);
        Ok(())
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        self.handlers.lock().push(handler);
    }

    fn me(&self) -> &Identity {
        &self.me
    }
}

pub(crate) fn provider_identity(channel_name: &str, owner: &str) -> ProviderIdentity {
    ProviderIdentity {
        channel_id: format!("{channel_name}-{owner}"),
        channel_name: channel_name.to_string(),
        uuid: owner.to_string(),
        name: owner.to_string(),
    }
}
