use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::{TransportError, TransportResult};
use crate::transport::{FrameTransport, TransportStats};

pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Configuration for the in-process channel frame transport.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    fn capacity(&self) -> usize {
        (self.buffer_size / 1024).max(16)
    }
}

/// In-process frame transport over tokio channels, used to attach
/// applications to a runtime living in the same process.
pub struct ChannelFrameTransport {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<TransportStats>>,
    name: String,
}

impl ChannelFrameTransport {
    /// Create a pair of connected transports.
    pub fn create_pair(
        name: impl Into<String>,
        config: ChannelConfig,
    ) -> TransportResult<(Self, Self)> {
        let name = name.into();
        let capacity = config.capacity();

        let (tx1, rx1) = mpsc::channel(capacity);
        let (tx2, rx2) = mpsc::channel(capacity);

        Ok((
            Self::from_parts(tx1, rx2, format!("{}-app", name)),
            Self::from_parts(tx2, rx1, format!("{}-runtime", name)),
        ))
    }

    fn from_parts(sender: mpsc::Sender<Bytes>, receiver: mpsc::Receiver<Bytes>, name: String) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            closed_tx,
            closed_rx,
            stats: Arc::new(Mutex::new(TransportStats::default())),
            name,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn channel_closed() -> TransportError {
        TransportError::ReceiveFailed {
            attempts: 1,
            reason: "Channel closed".into(),
        }
    }
}

#[async_trait]
impl FrameTransport for ChannelFrameTransport {
    async fn send_frame(&self, data: &[u8]) -> TransportResult<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let result = sender
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::SendFailed {
                attempts: 1,
                reason: "Channel closed".into(),
            });

        let mut stats = self.stats.lock();
        match result {
            Ok(()) => {
                stats.messages_sent += 1;
                stats.bytes_sent += data.len() as u64;
            }
            Err(_) => stats.send_errors += 1,
        }

        result
    }

    async fn recv_frame(&self) -> TransportResult<Bytes> {
        let mut receiver = self.receiver.lock().await;

        let bytes = tokio::select! {
            _ = wait_closed(self.closed_rx.clone()) => {
                return Err(TransportError::ConnectionClosed);
            }
            frame = receiver.recv() => frame.ok_or_else(Self::channel_closed)?,
        };

        let mut stats = self.stats.lock();
        stats.messages_received += 1;
        stats.bytes_received += bytes.len() as u64;

        Ok(bytes)
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
            && self
                .sender
                .lock()
                .as_ref()
                .is_some_and(|sender| !sender.is_closed())
    }

    async fn close(&self) -> TransportResult<()> {
        self.sender.lock().take();
        let _ = self.closed_tx.send(true);
        Ok(())
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.stats.lock().clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            // sender half lives as long as the transport
            std::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for ChannelFrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFrameTransport")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
