//! Application-level wire protocol
//!
//! Every datagram body handed to the simulation is `tag(u8) || payload`.
//! AUTH and REMOTE_CALL traffic rides the reliable channel; WORLD_STATE and
//! PLAYER_MOVE are expected (not required) to arrive unreliable.

use serde::{Deserialize, Serialize};

use crate::game::player::Player;
use crate::util::Vec3;

/// Packet type tags (first byte of every datagram payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    AuthRequest = 2,
    AuthResponse = 3,
    PlayerMove = 4,
    PlayerAction = 5,
    ChatMessage = 6,
    WorldState = 7,
    /// Legacy alias for RemoteCall; same payload, same decode path
    RpcCall = 8,
    Broadcast = 9,
    RemoteCall = 0x20,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PacketType::Connect),
            1 => Some(PacketType::Disconnect),
            2 => Some(PacketType::AuthRequest),
            3 => Some(PacketType::AuthResponse),
            4 => Some(PacketType::PlayerMove),
            5 => Some(PacketType::PlayerAction),
            6 => Some(PacketType::ChatMessage),
            7 => Some(PacketType::WorldState),
            8 => Some(PacketType::RpcCall),
            9 => Some(PacketType::Broadcast),
            0x20 => Some(PacketType::RemoteCall),
            _ => None,
        }
    }
}

/// Errors decoding packet bodies
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("PLAYER_MOVE body too short: {0} bytes")]
    MoveTooShort(usize),
    #[error("PLAYER_MOVE contains non-finite coordinates")]
    MoveNotFinite,
}

/// Decode a PLAYER_MOVE body: three little-endian f32 values
pub fn decode_move(body: &[u8]) -> Result<Vec3, ProtocolError> {
    if body.len() < 12 {
        return Err(ProtocolError::MoveTooShort(body.len()));
    }

    let x = f32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let y = f32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let z = f32::from_le_bytes([body[8], body[9], body[10], body[11]]);

    let pos = Vec3::new(x, y, z);
    if !pos.is_finite() {
        return Err(ProtocolError::MoveNotFinite);
    }
    Ok(pos)
}

/// Encode a PLAYER_MOVE body
pub fn encode_move(pos: Vec3) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&pos.x.to_le_bytes());
    body.extend_from_slice(&pos.y.to_le_bytes());
    body.extend_from_slice(&pos.z.to_le_bytes());
    body
}

/// WORLD_STATE body: JSON-encoded authoritative snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub players: Vec<PlayerSnapshot>,
}

/// Per-player entry in a WORLD_STATE snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub peer_id: u32,
    pub db_id: u64,
    pub username: String,
    pub position: Vec3,
    pub health: i32,
    pub level: i32,
}

impl PlayerSnapshot {
    pub fn from_player(player: &Player) -> Self {
        Self {
            peer_id: player.peer_id,
            db_id: player.db_id,
            username: player.username.clone(),
            position: player.position,
            health: player.health,
            level: player.level,
        }
    }
}
