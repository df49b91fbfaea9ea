//! # Driven Ports (Outbound SPI)
//!
//! The transport channel the engine runs on top of. Connection establishment,
//! reuse and framing belong to the implementation, not the engine.

use crate::domain::command::RemotingCommand;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identity of one duplex connection as seen from one side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: Uuid,
    remote_addr: Arc<str>,
}

impl ConnectionHandle {
    /// New handle with a random connection ID
    pub fn new(remote_addr: &str) -> Self {
        Self::with_id(Uuid::new_v4(), remote_addr)
    }

    pub fn with_id(id: Uuid, remote_addr: &str) -> Self {
        Self {
            id,
            remote_addr: Arc::from(remote_addr),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the peer on the other end
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.remote_addr, self.id)
    }
}

/// Events a transport delivers to the engine, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A command arrived on a connection
    Inbound(ConnectionHandle, RemotingCommand),
    /// The connection is closed or broken; nothing more will arrive on it
    ConnectionLost(ConnectionHandle),
}

/// Errors from transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connection could be established or reused
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// Write refused, e.g. outbound buffer full
    #[error("send rejected: {0}")]
    SendRejected(String),
    /// Connection is no longer usable
    #[error("connection closed")]
    ConnectionClosed,
    /// Encoded frame exceeds the transport's limit
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
}

/// Abstract interface for the duplex frame transport.
///
/// Inbound traffic is not pulled through this trait; implementations hand the
/// engine an `mpsc::Receiver<TransportEvent>` at construction time.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; sends happen concurrently from
/// callers, handler workers and the inbound loop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create or reuse a connection to `addr`.
    async fn resolve_connection(&self, addr: &str) -> Result<ConnectionHandle, TransportError>;

    /// Write one command on `connection`.
    ///
    /// Returns once the transport has accepted the write; must not wait for
    /// the peer.
    async fn send(
        &self,
        connection: &ConnectionHandle,
        command: &RemotingCommand,
    ) -> Result<(), TransportError>;
}
