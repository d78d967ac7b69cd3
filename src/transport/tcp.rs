use crate::error::{TransportError, TransportResult};
use crate::message::types::MAX_MESSAGE_SIZE;
use crate::transport::{FrameTransport, TransportStats};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Configuration for TCP transport
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum frame size in bytes
    pub max_message_size: usize,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Write timeout (None for no timeout)
    pub write_timeout: Option<Duration>,
    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

impl TcpConfig {
    /// Create a new configuration with custom max frame size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set write timeout
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Length-prefixed TCP frame transport to a runtime process.
///
/// Reads and writes use separate halves so a parked receive loop never
/// blocks outgoing requests. The connection is long-lived, so reads carry no
/// timeout; request deadlines belong to [`ConnectionConfig`](super::ConnectionConfig).
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    connected: AtomicBool,
    stats: parking_lot::Mutex<TransportStats>,
}

impl TcpTransport {
    /// Create a new TCP transport by connecting to an address
    pub async fn connect(addr: SocketAddr, config: TcpConfig) -> TransportResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                duration_ms: config.connect_timeout.as_millis() as u64,
                operation: format!("connecting to {}", addr),
            })?
            .map_err(|e| TransportError::ConnectionFailed {
                name: addr.to_string(),
                attempts: 1,
                reason: e.to_string(),
            })?;

        Self::from_stream(stream, config)
    }

    /// Create a new TCP transport from an existing stream
    pub fn from_stream(stream: TcpStream, config: TcpConfig) -> TransportResult<Self> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::Protocol(format!("Failed to get peer address: {}", e)))?;

        // Disable Nagle's algorithm for lower latency
        if config.nodelay {
            stream.set_nodelay(true).map_err(|e| {
                TransportError::Protocol(format!("Failed to set TCP_NODELAY: {}", e))
            })?;
        }

        let (reader, writer) = stream.into_split();

        Ok(Self {
            config,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr,
            connected: AtomicBool::new(true),
            stats: parking_lot::Mutex::new(TransportStats::default()),
        })
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn send_failed(&self, e: std::io::Error) -> TransportError {
        self.connected.store(false, Ordering::Release);
        self.stats.lock().send_errors += 1;
        TransportError::SendFailed {
            attempts: 1,
            reason: e.to_string(),
        }
    }

    fn recv_failed(&self, e: std::io::Error) -> TransportError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            self.connected.store(false, Ordering::Release);
            return TransportError::ConnectionClosed;
        }
        self.stats.lock().recv_errors += 1;
        TransportError::ReceiveFailed {
            attempts: 1,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl FrameTransport for TcpTransport {
    async fn send_frame(&self, data: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        if data.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }

        // Write length prefix (4 bytes, big-endian)
        let len_bytes = (data.len() as u32).to_be_bytes();

        let write_op = async {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(&len_bytes)
                .await
                .map_err(|e| self.send_failed(e))?;
            writer.write_all(data).await.map_err(|e| self.send_failed(e))?;
            Ok::<(), TransportError>(())
        };

        if let Some(timeout) = self.config.write_timeout {
            tokio::time::timeout(timeout, write_op)
                .await
                .map_err(|_| TransportError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                    operation: "TCP write".to_string(),
                })??;
        } else {
            write_op.await?;
        }

        let mut stats = self.stats.lock();
        stats.messages_sent += 1;
        stats.bytes_sent += data.len() as u64 + 4;

        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<Bytes> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut reader = self.reader.lock().await;

        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| self.recv_failed(e))?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: len,
                max: self.config.max_message_size,
            });
        }

        let mut buffer = vec![0u8; len];
        reader
            .read_exact(&mut buffer)
            .await
            .map_err(|e| self.recv_failed(e))?;

        let mut stats = self.stats.lock();
        stats.messages_received += 1;
        stats.bytes_received += len as u64 + 4;

        Ok(Bytes::from(buffer))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Release);
        let _ = self.writer.lock().await.shutdown().await;
        Ok(())
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.stats.lock().clone())
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

/// TCP listener the runtime uses to accept application connections
pub struct TcpTransportListener {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransportListener {
    /// Bind to a socket address and listen for incoming connections
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                name: addr.to_string(),
                attempts: 1,
                reason: e.to_string(),
            })?;

        Ok(Self { listener, config })
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> TransportResult<TcpTransport> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Protocol(format!("Failed to accept connection: {}", e)))?;

        TcpTransport::from_stream(stream, self.config.clone())
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::Protocol(format!("Failed to get local address: {}", e)))
    }
}

impl std::fmt::Debug for TcpTransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransportListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_frames_roundtrip() {
        let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            let frame = transport.recv_frame().await.unwrap();
            transport.send_frame(&frame).await.unwrap();
        });

        let client = TcpTransport::connect(addr, TcpConfig::default()).await.unwrap();
        client.send_frame(b"{\"action\":\"ping\"}").await.unwrap();
        let echoed = client.recv_frame().await.unwrap();
        assert_eq!(echoed.as_ref(), b"{\"action\":\"ping\"}");

        server.await.unwrap();

        let stats = client.stats().unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
    }

    #[tokio::test]
    async fn test_tcp_rejects_oversized_frame() {
        let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let client = TcpTransport::connect(addr, TcpConfig::default().with_max_message_size(8))
            .await
            .unwrap();
        let err = client.send_frame(&[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 16, max: 8 }));

        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_peer_close_reports_closed() {
        let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            transport.close().await.unwrap();
        });

        let client = TcpTransport::connect(addr, TcpConfig::default()).await.unwrap();
        server.await.unwrap();

        assert!(matches!(
            client.recv_frame().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(!client.is_connected());
    }
}
