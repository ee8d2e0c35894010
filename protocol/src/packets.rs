//! Relaymesh packet model
//!
//! A packet is a tag, the sender's server id and a payload whose shape is
//! fixed by the tag. On the wire it is the compact JSON object
//! `{"t": "<TAG>", "sid": "<id|null>", "p": <object|null>}`.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    /// Dialer authentication
    Handshake,
    HandshakeOk,

    /// Relayed chat and console traffic
    Chat,
    DiscordChat,
    Command,

    /// Relayed player events
    EventJoin,
    EventLeave,
    EventDeath,

    /// Remote player list query
    PlayerListRequest,
    PlayerListSnapshot,

    /// Reserved
    Heartbeat,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::HandshakeOk => "HANDSHAKE_OK",
            Self::Chat => "CHAT",
            Self::DiscordChat => "DISCORD_CHAT",
            Self::Command => "COMMAND",
            Self::EventJoin => "EVENT_JOIN",
            Self::EventLeave => "EVENT_LEAVE",
            Self::EventDeath => "EVENT_DEATH",
            Self::PlayerListRequest => "PLAYER_LIST_REQUEST",
            Self::PlayerListSnapshot => "PLAYER_LIST_SNAPSHOT",
            Self::Heartbeat => "HEARTBEAT",
        }
    }
}

/// HANDSHAKE payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Shared secret, compared byte-exact by the acceptor
    pub key: String,
    pub server_id: String,
    /// Epoch milliseconds at the dialer
    pub time: i64,
}

/// CHAT payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub player: String,
    pub message: String,
}

/// DISCORD_CHAT payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordChatPayload {
    pub user: String,
    pub message: String,
}

/// COMMAND payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
}

/// EVENT_JOIN / EVENT_LEAVE / EVENT_DEATH payload
///
/// Only `player` is required; event-specific fields (a death message, say)
/// are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEventPayload {
    pub player: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlayerEventPayload {
    pub fn new(player: impl Into<String>) -> Self {
        Self {
            player: player.into(),
            extra: Map::new(),
        }
    }

    /// Attach an event-specific field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// PLAYER_LIST_SNAPSHOT payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerListSnapshotPayload {
    pub players: Vec<String>,
}

/// Packet body, one variant per tag
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Handshake(HandshakePayload),
    HandshakeOk,
    Chat(ChatPayload),
    DiscordChat(DiscordChatPayload),
    Command(CommandPayload),
    EventJoin(PlayerEventPayload),
    EventLeave(PlayerEventPayload),
    EventDeath(PlayerEventPayload),
    PlayerListRequest,
    PlayerListSnapshot(PlayerListSnapshotPayload),
    Heartbeat,
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Handshake(_) => PacketType::Handshake,
            Self::HandshakeOk => PacketType::HandshakeOk,
            Self::Chat(_) => PacketType::Chat,
            Self::DiscordChat(_) => PacketType::DiscordChat,
            Self::Command(_) => PacketType::Command,
            Self::EventJoin(_) => PacketType::EventJoin,
            Self::EventLeave(_) => PacketType::EventLeave,
            Self::EventDeath(_) => PacketType::EventDeath,
            Self::PlayerListRequest => PacketType::PlayerListRequest,
            Self::PlayerListSnapshot(_) => PacketType::PlayerListSnapshot,
            Self::Heartbeat => PacketType::Heartbeat,
        }
    }

    pub fn chat(player: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Chat(ChatPayload {
            player: player.into(),
            message: message.into(),
        })
    }

    pub fn discord_chat(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DiscordChat(DiscordChatPayload {
            user: user.into(),
            message: message.into(),
        })
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self::Command(CommandPayload {
            command: command.into(),
        })
    }
}

/// The unit of exchange between mesh nodes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WirePacket")]
pub struct NetworkPacket {
    /// Sender's logical server id, `None` for anonymous packets
    pub server_id: Option<String>,
    pub body: PacketBody,
}

impl NetworkPacket {
    pub fn new(server_id: impl Into<String>, body: PacketBody) -> Self {
        Self {
            server_id: Some(server_id.into()),
            body,
        }
    }

    pub fn anonymous(body: PacketBody) -> Self {
        Self {
            server_id: None,
            body,
        }
    }

    /// HANDSHAKE announcing `server_id`, stamped with the current time
    pub fn handshake(key: &str, server_id: &str) -> Self {
        Self::new(
            server_id,
            PacketBody::Handshake(HandshakePayload {
                key: key.to_string(),
                server_id: server_id.to_string(),
                time: chrono::Utc::now().timestamp_millis(),
            }),
        )
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// Serialize to compact JSON
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse compact JSON; a payload that does not match its tag is
    /// reported as `InvalidPayload`
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WirePacket = serde_json::from_slice(bytes)?;
        wire.try_into()
    }
}

impl Serialize for NetworkPacket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("NetworkPacket", 3)?;
        state.serialize_field("t", &self.packet_type())?;
        state.serialize_field("sid", &self.server_id)?;
        match &self.body {
            PacketBody::Handshake(p) => state.serialize_field("p", p)?,
            PacketBody::Chat(p) => state.serialize_field("p", p)?,
            PacketBody::DiscordChat(p) => state.serialize_field("p", p)?,
            PacketBody::Command(p) => state.serialize_field("p", p)?,
            PacketBody::EventJoin(p) | PacketBody::EventLeave(p) | PacketBody::EventDeath(p) => {
                state.serialize_field("p", p)?
            }
            PacketBody::PlayerListSnapshot(p) => state.serialize_field("p", p)?,
            PacketBody::HandshakeOk | PacketBody::PlayerListRequest | PacketBody::Heartbeat => {
                state.serialize_field("p", &Option::<()>::None)?
            }
        }
        state.end()
    }
}

/// Loosely-typed wire form, checked against the tag on conversion
#[derive(Deserialize)]
struct WirePacket {
    t: PacketType,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    p: Option<Value>,
}

fn typed_payload<T: DeserializeOwned>(
    packet_type: PacketType,
    payload: Option<Value>,
) -> Result<T, ProtocolError> {
    let value = payload.ok_or_else(|| ProtocolError::InvalidPayload {
        packet_type: packet_type.as_str(),
        reason: "missing payload".to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        packet_type: packet_type.as_str(),
        reason: e.to_string(),
    })
}

impl TryFrom<WirePacket> for NetworkPacket {
    type Error = ProtocolError;

    fn try_from(wire: WirePacket) -> Result<Self, Self::Error> {
        let WirePacket { t, sid, p } = wire;
        let body = match t {
            PacketType::Handshake => PacketBody::Handshake(typed_payload(t, p)?),
            PacketType::HandshakeOk => PacketBody::HandshakeOk,
            PacketType::Chat => PacketBody::Chat(typed_payload(t, p)?),
            PacketType::DiscordChat => PacketBody::DiscordChat(typed_payload(t, p)?),
            PacketType::Command => PacketBody::Command(typed_payload(t, p)?),
            PacketType::EventJoin => PacketBody::EventJoin(typed_payload(t, p)?),
            PacketType::EventLeave => PacketBody::EventLeave(typed_payload(t, p)?),
            PacketType::EventDeath => PacketBody::EventDeath(typed_payload(t, p)?),
            PacketType::PlayerListRequest => PacketBody::PlayerListRequest,
            PacketType::PlayerListSnapshot => PacketBody::PlayerListSnapshot(typed_payload(t, p)?),
            PacketType::Heartbeat => PacketBody::Heartbeat,
        };
        Ok(Self { server_id: sid, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_wire_shape() {
        let packet = NetworkPacket::new("A", PacketBody::chat("Alice", "hi"));
        let value: Value = serde_json::from_slice(&packet.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"t": "CHAT", "sid": "A", "p": {"player": "Alice", "message": "hi"}})
        );
    }

    #[test]
    fn test_unit_payload_is_null() {
        let packet = NetworkPacket::new("lobby", PacketBody::HandshakeOk);
        let value: Value = serde_json::from_slice(&packet.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"t": "HANDSHAKE_OK", "sid": "lobby", "p": null}));
    }

    #[test]
    fn test_missing_payload_and_sid_accepted_for_unit_kinds() {
        let packet = NetworkPacket::from_json(br#"{"t":"PLAYER_LIST_REQUEST"}"#).unwrap();
        assert_eq!(packet, NetworkPacket::anonymous(PacketBody::PlayerListRequest));
    }

    #[test]
    fn test_missing_payload_rejected_for_chat() {
        let result = NetworkPacket::from_json(br#"{"t":"CHAT","sid":"A"}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidPayload { packet_type: "CHAT", .. })
        ));
    }

    #[test]
    fn test_wrong_payload_shape_rejected() {
        let result = NetworkPacket::from_json(br#"{"t":"COMMAND","sid":"A","p":{"cmd":"say hi"}}"#);
        match result {
            Err(ProtocolError::InvalidPayload { packet_type, reason }) => {
                assert_eq!(packet_type, "COMMAND");
                assert!(reason.contains("command"), "reason: {}", reason);
            }
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result = NetworkPacket::from_json(br#"{"t":"TELEPORT","sid":"A","p":null}"#);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_serde_deserialize_agrees_with_from_json() {
        let raw = r#"{"t":"CHAT","sid":"A","p":{"player":"Alice","message":"hi"}}"#;
        let via_serde: NetworkPacket = serde_json::from_str(raw).unwrap();
        assert_eq!(via_serde, NetworkPacket::from_json(raw.as_bytes()).unwrap());
    }

    #[test]
    fn test_player_event_keeps_extra_fields() {
        let raw = br#"{"t":"EVENT_DEATH","sid":"survival","p":{"player":"Steve","message":"Steve fell from a high place"}}"#;
        let packet = NetworkPacket::from_json(raw).unwrap();

        let expected = PlayerEventPayload::new("Steve").with("message", "Steve fell from a high place");
        assert_eq!(packet.body, PacketBody::EventDeath(expected));

        let again = NetworkPacket::from_json(&packet.to_json().unwrap()).unwrap();
        assert_eq!(again, packet);
    }

    #[test]
    fn test_handshake_carries_identity_and_time() {
        let before = chrono::Utc::now().timestamp_millis();
        let packet = NetworkPacket::handshake("s3cret", "A");
        assert_eq!(packet.server_id.as_deref(), Some("A"));
        match packet.body {
            PacketBody::Handshake(p) => {
                assert_eq!(p.key, "s3cret");
                assert_eq!(p.server_id, "A");
                assert!(p.time >= before);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_tag_names() {
        for (packet_type, name) in [
            (PacketType::HandshakeOk, "HANDSHAKE_OK"),
            (PacketType::DiscordChat, "DISCORD_CHAT"),
            (PacketType::PlayerListSnapshot, "PLAYER_LIST_SNAPSHOT"),
        ] {
            assert_eq!(packet_type.as_str(), name);
            assert_eq!(serde_json::to_value(packet_type).unwrap(), json!(name));
        }
    }
}
