//! Dispatch of authenticated packets
//!
//! Nothing here mutates host state from the I/O task: every host-facing side
//! effect is handed to the host's main-context executor.

use crate::manager::Node;
use protocol::packets::PlayerListSnapshotPayload;
use protocol::{NetworkPacket, PacketBody, PacketType};
use std::sync::Arc;
use tracing::debug;

/// Route a packet received from the authenticated server `origin`
pub fn dispatch(node: &Arc<Node>, origin: &str, packet: NetworkPacket) {
    match packet.packet_type() {
        PacketType::PlayerListRequest => {
            let node = node.clone();
            let origin = origin.to_string();
            node.host.executor.clone().execute(Box::new(move || {
                let players = node.host.players.online_players();
                debug!("Answering player list request from {} ({} players)", origin, players.len());
                node.send_to(
                    &origin,
                    PacketBody::PlayerListSnapshot(PlayerListSnapshotPayload { players }),
                );
            }));
        }

        PacketType::Chat
        | PacketType::DiscordChat
        | PacketType::Command
        | PacketType::EventJoin
        | PacketType::EventLeave
        | PacketType::EventDeath
        | PacketType::PlayerListSnapshot => {
            let listener = node.host.listener.clone();
            let origin = origin.to_string();
            node.host
                .executor
                .execute(Box::new(move || listener.on_packet(&origin, packet)));
        }

        PacketType::Heartbeat => {
            debug!("Heartbeat from {}", origin);
        }

        packet_type @ (PacketType::Handshake | PacketType::HandshakeOk) => {
            debug!(
                "Ignoring {} from already authenticated server {}",
                packet_type.as_str(),
                origin
            );
        }
    }
}
