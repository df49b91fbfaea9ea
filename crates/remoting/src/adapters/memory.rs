//! In-memory duplex transport.
//!
//! Peers bind an address on a shared [`MemoryNetwork`] and receive their
//! inbound traffic on an `mpsc` channel. Every frame goes through the
//! reference codec, so frame limits behave as they would on a socket, and
//! each peer's inbound buffer is bounded so a slow peer surfaces as a
//! rejected send.

use crate::adapters::codec::{CodecError, FrameCodec};
use crate::domain::command::RemotingCommand;
use crate::domain::config::RemotingConfig;
use crate::ports::outbound::{ConnectionHandle, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Both ends of one connection
#[derive(Debug, Clone)]
struct Link {
    ends: [String; 2],
}

impl Link {
    fn other(&self, local: &str) -> &str {
        if self.ends[0] == local {
            &self.ends[1]
        } else {
            &self.ends[0]
        }
    }
}

struct NetworkInner {
    peers: DashMap<String, mpsc::Sender<TransportEvent>>,
    links: DashMap<Uuid, Link>,
    /// Ordered address pair -> connection id, shared by both ends
    routes: DashMap<(String, String), Uuid>,
    codec: FrameCodec,
    inbound_buffer: usize,
}

/// Route key for a pair of peers, the same from either end.
fn route_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl NetworkInner {
    fn deliver(&self, addr: &str, event: TransportEvent) -> Result<(), TransportError> {
        let sender = self
            .peers
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::ConnectionClosed)?;

        sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::SendRejected(format!("inbound buffer of {} is full", addr))
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    /// Deliver a lifecycle event even when the peer's buffer is full.
    fn deliver_reliably(&self, addr: &str, event: TransportEvent) {
        let Some(sender) = self.peers.get(addr).map(|entry| entry.value().clone()) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = sender.try_send(event) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = sender.send(event).await;
                    });
                }
                Err(_) => warn!(addr = addr, "Dropped lifecycle event outside runtime"),
            }
        }
    }

    fn close(&self, id: Uuid) -> bool {
        let Some((_, link)) = self.links.remove(&id) else {
            return false;
        };
        let [a, b] = &link.ends;
        self.routes.remove_if(&route_key(a, b), |_, route| *route == id);

        debug!(connection = %id, a = %a, b = %b, "Closing in-memory connection");
        self.deliver_reliably(a, TransportEvent::ConnectionLost(ConnectionHandle::with_id(id, b)));
        if a != b {
            self.deliver_reliably(b, TransportEvent::ConnectionLost(ConnectionHandle::with_id(id, a)));
        }
        true
    }
}

/// Shared in-process network that peers bind addresses on.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new(max_frame_size: usize, inbound_buffer: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                peers: DashMap::new(),
                links: DashMap::new(),
                routes: DashMap::new(),
                codec: FrameCodec::new(max_frame_size),
                inbound_buffer: inbound_buffer.max(1),
            }),
        }
    }

    /// Network sized from a remoting configuration
    pub fn from_config(config: &RemotingConfig) -> Self {
        Self::new(config.invoke.max_frame_size, config.transport.outbound_buffer)
    }

    /// Bind `addr` and get the transport plus its inbound event stream.
    pub fn bind(
        &self,
        addr: &str,
    ) -> Result<(MemoryTransport, mpsc::Receiver<TransportEvent>), TransportError> {
        let (tx, rx) = mpsc::channel(self.inner.inbound_buffer);
        match self.inner.peers.entry(addr.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::ConnectFailed(format!(
                    "address {} already bound",
                    addr
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        debug!(addr = addr, "Bound in-memory peer");
        Ok((
            MemoryTransport {
                local_addr: addr.to_string(),
                network: Arc::clone(&self.inner),
            },
            rx,
        ))
    }

    /// Remove a peer; all of its connections are closed.
    pub fn unbind(&self, addr: &str) {
        let ids: Vec<Uuid> = self
            .inner
            .links
            .iter()
            .filter(|entry| entry.value().ends.iter().any(|end| end == addr))
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.inner.close(id);
        }
        self.inner.peers.remove(addr);
    }

    /// Sever one connection; both ends receive `ConnectionLost`.
    pub fn disconnect(&self, connection: &ConnectionHandle) -> bool {
        self.inner.close(connection.id())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.links.len()
    }
}

/// One peer's view of the [`MemoryNetwork`].
pub struct MemoryTransport {
    local_addr: String,
    network: Arc<NetworkInner>,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Sever a connection this peer holds.
    pub fn close_connection(&self, connection: &ConnectionHandle) -> bool {
        self.network.close(connection.id())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn resolve_connection(&self, addr: &str) -> Result<ConnectionHandle, TransportError> {
        if !self.network.peers.contains_key(addr) {
            return Err(TransportError::ConnectFailed(format!(
                "no peer bound at {}",
                addr
            )));
        }

        // One entry per peer pair, so two ends resolving each other at once
        // agree on a single link. The link is published under the entry guard.
        let id = match self.network.routes.entry(route_key(&self.local_addr, addr)) {
            dashmap::mapref::entry::Entry::Occupied(entry) => *entry.get(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let id = Uuid::new_v4();
                self.network.links.insert(
                    id,
                    Link {
                        ends: [self.local_addr.clone(), addr.to_string()],
                    },
                );
                entry.insert(id);
                debug!(connection = %id, local = %self.local_addr, remote = addr, "Opened in-memory connection");
                id
            }
        };

        Ok(ConnectionHandle::with_id(id, addr))
    }

    async fn send(
        &self,
        connection: &ConnectionHandle,
        command: &RemotingCommand,
    ) -> Result<(), TransportError> {
        let remote = self
            .network
            .links
            .get(&connection.id())
            .map(|link| link.other(&self.local_addr).to_string())
            .ok_or(TransportError::ConnectionClosed)?;

        let frame = self.network.codec.encode(command).map_err(|e| match e {
            CodecError::FrameTooLarge { size, max } => TransportError::FrameTooLarge { size, max },
            other => TransportError::SendRejected(other.to_string()),
        })?;

        let mut wire = BytesMut::from(&frame[..]);
        let decoded = match self.network.codec.decode(&mut wire) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                return Err(TransportError::SendRejected("incomplete frame".into()));
            }
            Err(e) => {
                warn!(error = %e, "Peer would reject frame");
                return Err(TransportError::SendRejected(e.to_string()));
            }
        };

        let from = ConnectionHandle::with_id(connection.id(), &self.local_addr);
        self.network
            .deliver(&remote, TransportEvent::Inbound(from, decoded))
    }
}
