//! Handshake handler
//!
//! The dialer sends HANDSHAKE with the shared secret and its server id; the
//! acceptor checks the secret, registers the connection and answers
//! HANDSHAKE_OK; the dialer registers on receipt of HANDSHAKE_OK.

use crate::error::SessionError;
use crate::manager::Node;
use crate::registry::Registration;
use crate::session::{Direction, PeerConnection};
use protocol::packets::HandshakePayload;
use protocol::{NetworkPacket, PacketBody};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle HANDSHAKE on an accepted connection
///
/// Returns the authenticated server id. A secret mismatch yields an error
/// and no reply is sent.
pub fn handle_handshake(
    node: &Node,
    connection: &Arc<PeerConnection>,
    payload: &HandshakePayload,
) -> Result<String, SessionError> {
    if payload.key != node.config.key {
        return Err(SessionError::SecretMismatch);
    }

    let server_id = payload.server_id.trim();
    if server_id.is_empty() {
        return Err(SessionError::InvalidIdentity("empty server id".to_string()));
    }
    if server_id == node.config.server_id {
        return Err(SessionError::InvalidIdentity(format!(
            "peer announced this server's own id {}",
            server_id
        )));
    }

    register(node, server_id, connection)?;
    connection.queue(NetworkPacket::new(&node.config.server_id, PacketBody::HandshakeOk));
    Ok(server_id.to_string())
}

/// Handle HANDSHAKE_OK on a dialed connection
///
/// The connection is registered under the id the peer announces, which is
/// normally the id it was configured under (`expected`).
pub fn handle_handshake_ok(
    node: &Node,
    connection: &Arc<PeerConnection>,
    announced: Option<&str>,
    expected: Option<&str>,
) -> Result<String, SessionError> {
    let server_id = announced
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SessionError::InvalidIdentity("HANDSHAKE_OK without server id".to_string()))?;

    if server_id == node.config.server_id {
        return Err(SessionError::InvalidIdentity(format!(
            "peer answered with this server's own id {}",
            server_id
        )));
    }
    if let Some(expected) = expected {
        if expected != server_id {
            warn!(
                "Server configured as {} at {} identifies itself as {}",
                expected,
                connection.remote_addr(),
                server_id
            );
        }
    }

    register(node, server_id, connection)?;
    Ok(server_id.to_string())
}

fn register(node: &Node, server_id: &str, connection: &Arc<PeerConnection>) -> Result<(), SessionError> {
    let own_id = node.config.server_id.as_str();
    let registration = node.registry.register_with(server_id, connection.clone(), |existing| {
        keep_existing(own_id, server_id, existing, connection)
    });

    match registration {
        Registration::Inserted => {
            info!(
                "Server {} authenticated ({:?}, {})",
                server_id,
                connection.direction(),
                connection.remote_addr()
            );
            Ok(())
        }
        Registration::Replaced(previous) => {
            info!(
                "Server {} reconnected ({:?}, {}), closing previous connection {}",
                server_id,
                connection.direction(),
                connection.remote_addr(),
                previous.id()
            );
            previous.close();
            Ok(())
        }
        Registration::Kept(_) => Err(SessionError::Duplicate(server_id.to_string())),
    }
}

/// Decide whether an already registered connection beats a new one
///
/// Must not touch the registry: it runs under the registry's entry lock.
///
/// Same direction means the peer (or we) reconnected, so the new connection
/// wins. Opposite directions happen when both sides dial each other at once;
/// both ends then keep the connection dialed by the lexicographically smaller
/// server id, so they settle on the same socket.
pub fn keep_existing(own_id: &str, peer_id: &str, existing: &PeerConnection, new: &PeerConnection) -> bool {
    if existing.is_closed() || existing.direction() == new.direction() {
        return false;
    }

    let existing_dialer = match existing.direction() {
        Direction::Outbound => own_id,
        Direction::Inbound => peer_id,
    };
    existing_dialer == own_id.min(peer_id)
}
