//! interappbus - channel-based messaging between applications sharing a runtime
pub mod channel;
pub mod codec;
pub mod error;
pub mod events;
pub mod identity;
pub mod message;
pub mod runtime;
pub mod transport;

pub use channel::{
    ChannelActions, ChannelClient, ChannelEndpoint, ChannelProvider, ChannelRegistry, ConnectOptions,
};
pub use codec::{Codec, JsonCodec};
pub use error::{ChannelError, Result, RuntimeError, TransportError, TransportResult, INTERNAL_NACK};
pub use events::{ChannelEvent, ChannelEventKind, ListenerId};
pub use identity::{ClientDisconnected, Identity, ProviderIdentity};
pub use message::types::{AckPayload, MessageId};
pub use message::Message;
pub use runtime::{ConnectionHandle, LocalRuntime, RuntimeConfig};
pub use transport::channel::{ChannelConfig, ChannelFrameTransport};
pub use transport::tcp::{TcpConfig, TcpTransport, TcpTransportListener};
pub use transport::{ConnectionConfig, FrameTransport, MessageHandler, RuntimeConnection, TransportStats, Wire};

#[cfg(feature = "codec-messagepack")]
pub use codec::MessagePackCodec;
