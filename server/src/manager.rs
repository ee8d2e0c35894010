//! Network manager
//!
//! Owns the listening socket, the outbound dial scheduler, the per-connection
//! session tasks and the public send API. It is the only part of the network
//! layer the host application talks to.

use crate::config::{NetworkConfig, RemoteServer};
use crate::error::SessionError;
use crate::handlers;
use crate::host::HostBindings;
use crate::registry::ConnectionRegistry;
use crate::session::{ConnectionState, Direction, PeerConnection};
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use protocol::{
    AesGcmCipher, NetworkPacket, PacketBody, PacketCodec, ProtocolError, CONNECT_TIMEOUT, MAX_FRAME_SIZE,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// State shared by the manager and every connection task
pub(crate) struct Node {
    pub(crate) config: NetworkConfig,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) host: HostBindings,
    codec: PacketCodec,
    /// Peers with a dial or dialed session in flight
    pending: DashSet<String>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Node {
    fn stamp(&self, body: PacketBody) -> NetworkPacket {
        NetworkPacket::new(&self.config.server_id, body)
    }

    /// Stamp `body` and check that it fits in one frame
    fn prepare(&self, body: PacketBody) -> Option<NetworkPacket> {
        let packet = self.stamp(body);
        match self.codec.sealed_len(&packet) {
            Ok(len) if len <= MAX_FRAME_SIZE => Some(packet),
            Ok(len) => {
                warn!(
                    "Dropping {} packet: frame of {} bytes exceeds the {} byte limit",
                    packet.packet_type().as_str(),
                    len,
                    MAX_FRAME_SIZE
                );
                None
            }
            Err(e) => {
                warn!("Dropping {} packet: {}", packet.packet_type().as_str(), e);
                None
            }
        }
    }

    pub(crate) fn broadcast(&self, body: PacketBody, exclude: Option<&str>) -> usize {
        let Some(packet) = self.prepare(body) else {
            return 0;
        };
        self.registry
            .all_except(exclude)
            .into_iter()
            .filter(|(_, connection)| connection.queue(packet.clone()))
            .count()
    }

    pub(crate) fn send_to(&self, server_id: &str, body: PacketBody) -> bool {
        match self.registry.get(server_id) {
            Some(connection) => match self.prepare(body) {
                Some(packet) => connection.queue(packet),
                None => false,
            },
            None => {
                debug!("Not connected to {}, dropping {}", server_id, body.packet_type().as_str());
                false
            }
        }
    }

    fn check_allowed(&self, addr: &SocketAddr) {
        let allowed = &self.config.allowed_ips;
        if !allowed.is_empty() && !allowed.contains(&addr.ip()) {
            warn!(
                "Connection from {} is not listed in network.allowed_ips (advisory, not refused)",
                addr
            );
        }
    }
}

/// Entry point of the server-to-server network
pub struct NetworkManager {
    node: Arc<Node>,
    started: AtomicBool,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig, host: HostBindings) -> Self {
        let codec = if config.encryption {
            PacketCodec::encrypted(Arc::new(AesGcmCipher::from_secret(&config.key)))
        } else {
            warn!("Network encryption is disabled, packets travel as plaintext JSON");
            PacketCodec::plaintext()
        };

        Self {
            node: Arc::new(Node {
                config,
                registry: ConnectionRegistry::new(),
                host,
                codec,
                pending: DashSet::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.node.config
    }

    /// Bind the listener and start the dial scheduler
    ///
    /// Never fails: a bind error leaves the node without a listener while
    /// outbound dialing still runs.
    pub async fn start(&self) {
        let config = &self.node.config;
        if !config.enabled {
            info!("Network is disabled in configuration");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Network manager already started");
            return;
        }

        info!(
            "Starting network as {} ({})",
            config.server_id,
            if self.node.codec.is_encrypted() { "AES-GCM" } else { "plaintext" }
        );

        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        match TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!("Server {} listening on {}", config.server_id, bind_addr);
                self.node.tasks.spawn(accept_loop(self.node.clone(), listener));
            }
            Err(e) => {
                error!(
                    "Failed to bind network listener on {}: {} (inbound connections disabled)",
                    bind_addr, e
                );
            }
        }

        info!(
            "Dialing {} configured server(s) every {:?}",
            config.servers.len(),
            config.dial_interval
        );
        self.node.tasks.spawn(dial_loop(self.node.clone()));
    }

    /// Broadcast to every authenticated peer except `exclude`
    ///
    /// Fire-and-forget; returns the number of connections the packet was
    /// queued on.
    pub fn send(&self, body: PacketBody, exclude: Option<&str>) -> usize {
        self.node.broadcast(body, exclude)
    }

    /// Send to one peer; `false` if it is not connected
    pub fn send_to(&self, server_id: &str, body: PacketBody) -> bool {
        self.node.send_to(server_id, body)
    }

    /// Ask a peer for its player list; the answer arrives at the listener
    pub fn request_player_list(&self, server_id: &str) -> bool {
        self.node.send_to(server_id, PacketBody::PlayerListRequest)
    }

    /// Sorted ids of the currently authenticated peers
    pub fn connected_servers(&self) -> Vec<String> {
        self.node.registry.server_ids()
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.node.registry.contains(server_id)
    }

    /// Stop listening and dialing, close every connection and wait for
    /// their tasks; in-flight writes are best-effort
    pub async fn shutdown(&self) {
        info!("Shutting down network");
        self.node.shutdown.cancel();
        for connection in self.node.registry.drain() {
            connection.close();
        }
        self.node.tasks.close();
        self.node.tasks.wait().await;
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.node.shutdown.cancel();
    }
}

async fn accept_loop(node: Arc<Node>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = node.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    node.check_allowed(&addr);
                    node.tasks.spawn(run_session(node.clone(), stream, addr, Direction::Inbound, None));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    time::sleep(time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Accept loop stopped");
}

async fn dial_loop(node: Arc<Node>) {
    let mut interval = time::interval_at(
        Instant::now() + node.config.dial_initial_delay,
        node.config.dial_interval,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = node.shutdown.cancelled() => break,
            _ = interval.tick() => scan_peers(&node),
        }
    }
    debug!("Dial scheduler stopped");
}

/// Dial every configured peer that is neither connected nor already pending
fn scan_peers(node: &Arc<Node>) {
    for peer in &node.config.servers {
        if node.registry.contains(&peer.id) {
            continue;
        }
        if !node.pending.insert(peer.id.clone()) {
            debug!("Dial to {} still in flight, skipping", peer.id);
            continue;
        }
        node.tasks.spawn(dial(node.clone(), peer.clone()));
    }
}

/// Removes a peer from the pending set when the dial attempt ends
struct PendingDial<'a> {
    pending: &'a DashSet<String>,
    server_id: String,
}

impl Drop for PendingDial<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.server_id);
    }
}

async fn dial(node: Arc<Node>, peer: RemoteServer) {
    let _pending = PendingDial {
        pending: &node.pending,
        server_id: peer.id.clone(),
    };
    let address = peer.address();
    debug!("Connecting to server {} at {}", peer.id, address);

    let connect = tokio::select! {
        _ = node.shutdown.cancelled() => return,
        result = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)) => result,
    };

    match connect {
        Ok(Ok(stream)) => {
            let addr = match stream.peer_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Connection to server {} at {} failed: {}", peer.id, address, e);
                    return;
                }
            };
            run_session(node.clone(), stream, addr, Direction::Outbound, Some(peer.id.clone())).await;
        }
        Ok(Err(e)) => warn!("Failed to connect to server {} at {}: {}", peer.id, address, e),
        Err(_) => warn!(
            "Timed out connecting to server {} at {} after {:?}",
            peer.id, address, CONNECT_TIMEOUT
        ),
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    if let Err(e) = socket2::SockRef::from(stream).set_keepalive(true) {
        debug!("Failed to enable TCP keepalive: {}", e);
    }
}

/// One connection from handshake to close
struct Session {
    node: Arc<Node>,
    connection: Arc<PeerConnection>,
    state: ConnectionState,
    /// Id the dial scheduler expects on an outbound connection
    expected: Option<String>,
    /// Authenticated peer id
    server_id: Option<String>,
}

impl Session {
    fn handle(&mut self, packet: NetworkPacket) -> Result<(), SessionError> {
        if self.state == ConnectionState::Authenticated {
            if let Some(origin) = &self.server_id {
                handlers::dispatch(&self.node, origin, packet);
            }
            return Ok(());
        }

        let server_id = match (self.connection.direction(), packet.body) {
            (Direction::Inbound, PacketBody::Handshake(payload)) => {
                handlers::handle_handshake(&self.node, &self.connection, &payload)?
            }
            (Direction::Outbound, PacketBody::HandshakeOk) => handlers::handle_handshake_ok(
                &self.node,
                &self.connection,
                packet.server_id.as_deref(),
                self.expected.as_deref(),
            )?,
            (_, body) => {
                debug!(
                    "Ignoring {} from unauthenticated connection {}",
                    body.packet_type().as_str(),
                    self.connection.remote_addr()
                );
                return Ok(());
            }
        };

        self.state = ConnectionState::Authenticated;
        self.server_id = Some(server_id);
        Ok(())
    }
}

async fn run_session(
    node: Arc<Node>,
    stream: TcpStream,
    addr: SocketAddr,
    direction: Direction,
    expected: Option<String>,
) {
    configure_socket(&stream);
    let (connection, mut outbound) = PeerConnection::new(addr, direction, &node.shutdown);
    let mut session = Session {
        node: node.clone(),
        connection: connection.clone(),
        state: ConnectionState::Connecting,
        expected,
        server_id: None,
    };

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, node.codec.clone());
    let mut writer = FramedWrite::new(write_half, node.codec.clone());

    if direction == Direction::Outbound {
        connection.queue(NetworkPacket::handshake(&node.config.key, &node.config.server_id));
    }
    session.state = ConnectionState::AwaitingHandshake;

    let result = drive(&mut session, &mut reader, &mut writer, &mut outbound).await;

    session.state = ConnectionState::Closed;
    connection.close();
    if let Some(server_id) = node.registry.unregister(&connection) {
        info!("Server {} disconnected ({})", server_id, addr);
    }

    match result {
        Ok(()) => debug!("Connection {} with {} closed", connection.id(), addr),
        Err(SessionError::Protocol(e)) => {
            warn!("Protocol error on connection with {}: {}, closing", addr, e)
        }
        Err(SessionError::Duplicate(server_id)) => {
            debug!("Closing redundant connection {} to {} ({})", connection.id(), server_id, addr)
        }
        Err(e) => warn!("Rejected connection with {}: {}", addr, e),
    }
}

type Reader = FramedRead<tokio::net::tcp::OwnedReadHalf, PacketCodec>;
type Writer = FramedWrite<tokio::net::tcp::OwnedWriteHalf, PacketCodec>;

async fn drive(
    session: &mut Session,
    reader: &mut Reader,
    writer: &mut Writer,
    outbound: &mut mpsc::UnboundedReceiver<NetworkPacket>,
) -> Result<(), SessionError> {
    let connection = session.connection.clone();
    let handshake_timeout = session.node.config.handshake_timeout;
    let handshake_deadline = time::sleep(handshake_timeout);
    tokio::pin!(handshake_deadline);

    loop {
        tokio::select! {
            _ = connection.closed() => return Ok(()),

            _ = &mut handshake_deadline, if session.state != ConnectionState::Authenticated => {
                return Err(SessionError::HandshakeTimeout(handshake_timeout));
            }

            Some(packet) = outbound.recv() => match writer.send(packet).await {
                Ok(()) => {}
                Err(ProtocolError::FrameTooLarge { max, actual }) => {
                    warn!(
                        "Dropped outgoing frame of {} bytes to {} (limit {})",
                        actual,
                        connection.remote_addr(),
                        max
                    );
                }
                Err(e) => return Err(e.into()),
            },

            incoming = reader.next() => match incoming {
                Some(Ok(packet)) => session.handle(packet)?,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::InlineExecutor;

    fn node_with(config: NetworkConfig) -> NetworkManager {
        let host = HostBindings::new(
            Arc::new(InlineExecutor),
            Arc::new(|_: &str, _: NetworkPacket| {}),
            Arc::new(Vec::<String>::new),
        );
        NetworkManager::new(config, host)
    }

    #[test]
    fn test_send_without_peers_is_noop() {
        let manager = node_with(NetworkConfig::new("A", "s3cret", 0));
        assert_eq!(manager.send(PacketBody::chat("Alice", "hi"), None), 0);
        assert!(!manager.send_to("B", PacketBody::command("list")));
        assert!(!manager.request_player_list("B"));
        assert!(manager.connected_servers().is_empty());
    }

    #[test]
    fn test_broadcast_exclusion_and_unicast() {
        let manager = node_with(NetworkConfig::new("hub", "s3cret", 0));
        let root = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:25100".parse().unwrap();

        let mut queues = Vec::new();
        for id in ["P1", "P2", "P3"] {
            let (connection, rx) = PeerConnection::new(addr, Direction::Inbound, &root);
            manager.node.registry.register(id, connection);
            queues.push((id, rx));
        }

        assert_eq!(manager.send(PacketBody::chat("Alice", "hi"), Some("P2")), 2);
        assert!(manager.send_to("P3", PacketBody::command("list")));

        for (id, rx) in &mut queues {
            let mut received = Vec::new();
            while let Ok(packet) = rx.try_recv() {
                assert_eq!(packet.server_id.as_deref(), Some("hub"));
                received.push(packet.body);
            }
            match *id {
                "P1" => assert_eq!(received, vec![PacketBody::chat("Alice", "hi")]),
                "P2" => assert!(received.is_empty()),
                _ => assert_eq!(
                    received,
                    vec![PacketBody::chat("Alice", "hi"), PacketBody::command("list")]
                ),
            }
        }
    }

    #[test]
    fn test_oversized_packet_is_not_queued() {
        let manager = node_with(NetworkConfig::new("hub", "s3cret", 0));
        assert_eq!(manager.config().server_id, "hub");

        let root = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:25100".parse().unwrap();
        let (connection, mut rx) = PeerConnection::new(addr, Direction::Inbound, &root);
        manager.node.registry.register("P1", connection.clone());

        let huge = "x".repeat(900 * 1024);
        assert_eq!(manager.send(PacketBody::chat("Alice", huge.clone()), None), 0);
        assert!(!manager.send_to("P1", PacketBody::chat("Alice", huge)));
        assert!(rx.try_recv().is_err());

        assert_eq!(manager.send(PacketBody::chat("Alice", "hi"), None), 1);
        assert_eq!(rx.try_recv().unwrap().body, PacketBody::chat("Alice", "hi"));
        assert!(!connection.is_closed());
        assert!(manager.is_connected("P1"));
    }

    #[tokio::test]
    async fn test_disabled_network_does_not_listen() {
        let mut config = NetworkConfig::new("A", "s3cret", 25190);
        config.enabled = false;
        let manager = node_with(config);
        manager.start().await;
        assert!(TcpStream::connect("127.0.0.1:25190").await.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_contained() {
        let blocker = TcpListener::bind("127.0.0.1:25191").await.unwrap();
        let manager = node_with(NetworkConfig::new("A", "s3cret", 25191).with_bind_address("127.0.0.1"));
        manager.start().await;
        assert!(manager.connected_servers().is_empty());
        manager.shutdown().await;
        drop(blocker);
    }
}
