//! The transport contract the channel layer consumes.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::TransportResult;
use crate::identity::Identity;
use crate::message::types::AckPayload;
use crate::message::Message;

/// Handler for messages pushed by the runtime. Returns `true` when it
/// claimed the message so no other handler sees it.
pub type MessageHandler = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// A duplex, correlated message connection to the runtime process.
#[async_trait]
pub trait Wire: Send + Sync + Debug {
    /// Send an action and wait for the runtime's correlated acknowledgement.
    ///
    /// Resolves to the ack payload when the runtime reports success and
    /// fails with [`TransportError::Nack`](crate::error::TransportError::Nack)
    /// carrying the runtime's reason otherwise.
    async fn send_action(&self, action: &str, payload: Value) -> TransportResult<AckPayload>;

    /// Send a message without registering for a response.
    async fn send_raw(&self, message: Value) -> TransportResult<()>;

    /// Register a handler for pushed messages. Handlers are offered each
    /// message in registration order until one claims it.
    fn register_message_handler(&self, handler: MessageHandler);

    /// Identity of the local application.
    fn me(&self) -> &Identity;
}

#[async_trait]
impl<W: Wire + ?Sized> Wire for Arc<W> {
    async fn send_action(&self, action: &str, payload: Value) -> TransportResult<AckPayload> {
        (**self).send_action(action, payload).await
    }

    async fn send_raw(&self, message: Value) -> TransportResult<()> {
        (**self).send_raw(message).await
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        (**self).register_message_handler(handler)
    }

    fn me(&self) -> &Identity {
        (**self).me()
    }
}
