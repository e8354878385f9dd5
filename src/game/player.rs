//! Player entity owned by the world

use std::time::Instant;

use crate::net::peers::PeerId;
use crate::util::Vec3;

/// A connected, authenticated player.
///
/// `peer_id` is a non-owning reference into the peer registry; a peer can be
/// connected and authenticated without owning a Player yet (login may fail).
#[derive(Debug, Clone)]
pub struct Player {
    pub peer_id: PeerId,
    /// Primary key in the backing store
    pub db_id: u64,
    pub username: String,
    pub position: Vec3,
    pub health: i32,
    pub level: i32,
    /// Last time a packet from this peer touched the player
    pub last_activity: Instant,
}

impl Player {
    pub fn new(peer_id: PeerId, db_id: u64, username: String) -> Self {
        Self {
            peer_id,
            db_id,
            username,
            position: Vec3::ZERO,
            health: 100,
            level: 1,
            last_activity: Instant::now(),
        }
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}
