//! Peer connection handles

use protocol::NetworkPacket;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who opened the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by our scheduler
    Outbound,
}

/// Per-connection lifecycle; `Closed` is reachable from every state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingHandshake,
    Authenticated,
    Closed,
}

/// Handle to a live peer connection
///
/// The socket itself is owned by the connection's task; everyone else
/// talks to it through this handle.
#[derive(Debug)]
pub struct PeerConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    direction: Direction,
    outbound: mpsc::UnboundedSender<NetworkPacket>,
    closed: CancellationToken,
}

impl PeerConnection {
    /// Create a handle and the receiving end of its write queue
    ///
    /// The handle closes automatically when `parent` is cancelled.
    pub fn new(
        remote_addr: SocketAddr,
        direction: Direction,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NetworkPacket>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Self {
            id: ConnectionId::next(),
            remote_addr,
            direction,
            outbound,
            closed: parent.child_token(),
        };
        (Arc::new(connection), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queue a packet for writing; fire-and-forget
    ///
    /// Returns `false` if the connection is already closed.
    pub fn queue(&self, packet: NetworkPacket) -> bool {
        !self.closed.is_cancelled() && self.outbound.send(packet).is_ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
