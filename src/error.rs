use thiserror::Error;

/// Marker reason the runtime uses when no provider exists for a channel name.
pub const INTERNAL_NACK: &str = "internal-nack";

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Please provide a channelName string to {0} a channel.")]
    InvalidChannelName(&'static str),

    #[error("No channel found for channelName: {channel_name}")]
    ChannelNotFound { channel_name: String },

    #[error("Channel \"{0}\" is provided by this application.")]
    OwnChannel(String),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Remote(String),

    #[error("No action registered at target for {0}")]
    UnknownAction(String),

    #[error("{0}")]
    Handler(String),

    #[error("{0}")]
    NotConnected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection to {name} failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("Send failed after {attempts} attempt(s): {reason}")]
    SendFailed { attempts: u32, reason: String },

    #[error("Receive failed after {attempts} attempt(s): {reason}")]
    ReceiveFailed { attempts: u32, reason: String },

    #[error("Timed out after {duration_ms}ms: {operation}")]
    Timeout { duration_ms: u64, operation: String },

    #[error("Transport not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("{reason}")]
    Nack { reason: String },
}

/// Failures the in-process runtime reports back as negative acknowledgements.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Please provide a channelName to create a channel")]
    MissingChannelName,

    #[error("Channel \"{0}\" already exists.")]
    ChannelExists(String),

    /// No provider for the requested name; clients may wait and retry.
    #[error("{}", INTERNAL_NACK)]
    ChannelAbsent,

    #[error("Channel \"{0}\" has been destroyed.")]
    ChannelDestroyed(String),

    #[error("Only the provider may destroy channel \"{0}\".")]
    NotProvider(String),

    #[error("{0} is not connected to channel \"{1}\".")]
    NotMember(String, String),

    #[error("Connection has not registered an identity")]
    UnregisteredConnection,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("{0}")]
    Transport(#[from] TransportError),
}

impl TransportError {
    /// True when the runtime answered with the "no such channel" negative acknowledgement.
    pub fn is_channel_absent(&self) -> bool {
        matches!(self, TransportError::Nack { reason } if reason.contains(INTERNAL_NACK))
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Transport(err.into())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_detection() {
        let nack = TransportError::Nack {
            reason: INTERNAL_NACK.to_string(),
        };
        assert!(nack.is_channel_absent());

        let other = TransportError::Nack {
            reason: "permission denied".to_string(),
        };
        assert!(!other.is_channel_absent());
        assert!(!TransportError::ConnectionClosed.is_channel_absent());
    }

    #[test]
    fn test_runtime_absent_reason_is_marker() {
        let reason = RuntimeError::ChannelAbsent.to_string();
        assert_eq!(reason, INTERNAL_NACK);
        assert!(TransportError::Nack { reason }.is_channel_absent());
        assert_eq!(
            RuntimeError::ChannelDestroyed("prices".to_string()).to_string(),
            "Channel \"prices\" has been destroyed."
        );
    }

    #[test]
    fn test_not_found_names_channel() {
        let err = ChannelError::ChannelNotFound {
            channel_name: "prices".to_string(),
        };
        assert_eq!(err.to_string(), "No channel found for channelName: prices");
    }

    #[test]
    fn test_transport_error_keeps_source() {
        use std::error::Error;

        let err = ChannelError::from(TransportError::ConnectionClosed);
        assert_eq!(err.to_string(), "Connection closed");
        assert!(err.source().is_some());
    }
}
