//! Authoritative world: player records plus the spatial index
//!
//! The tick loop is the only mutator. The embedded grid is shared so hook
//! code and stats readers can run radius queries from other tasks while the
//! simulation advances.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::game::player::Player;
use crate::game::spatial::SpatialGrid;
use crate::net::peers::PeerId;
use crate::util::Vec3;

pub struct World {
    players: HashMap<PeerId, Player>,
    grid: Arc<SpatialGrid>,
}

impl World {
    pub fn new(cell_size: f32) -> Self {
        Self {
            players: HashMap::new(),
            grid: Arc::new(SpatialGrid::new(cell_size)),
        }
    }

    /// Shared handle to the spatial index for read-side consumers
    pub fn grid(&self) -> Arc<SpatialGrid> {
        self.grid.clone()
    }

    /// Insert a player into the map and the grid together
    pub fn add(&mut self, player: Player) {
        let peer_id = player.peer_id;
        let pos = player.position;
        self.players.insert(peer_id, player);
        self.grid.insert(peer_id, pos.x, pos.z);
    }

    /// Remove a player from the map and the grid together. Idempotent.
    pub fn remove(&mut self, peer_id: PeerId) -> Option<Player> {
        let player = self.players.remove(&peer_id);
        self.grid.remove(peer_id);
        player
    }

    /// Reconcile every player's grid cell with its current position
    pub fn update(&mut self, _dt: f32) {
        for (peer_id, player) in &self.players {
            self.grid.update(*peer_id, player.position.x, player.position.z);
        }
    }

    /// Move a player and note the activity. Returns the previous position.
    pub fn set_position(&mut self, peer_id: PeerId, position: Vec3) -> Option<Vec3> {
        let player = self.players.get_mut(&peer_id)?;
        let old = player.position;
        player.position = position;
        player.touch();
        Some(old)
    }

    pub fn touch(&mut self, peer_id: PeerId) {
        if let Some(player) = self.players.get_mut(&peer_id) {
            player.touch();
        }
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Player> {
        self.players.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: PeerId) -> Option<&mut Player> {
        self.players.get_mut(&peer_id)
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.players.contains_key(&peer_id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Players inside the grid cells covering the given disk.
    /// Ids the grid returns without a live player are skipped; queries may
    /// race a removal from another snapshot in flight.
    pub fn players_in_radius(&self, x: f32, z: f32, radius: f32) -> Vec<&Player> {
        self.grid
            .query_radius(x, z, radius)
            .into_iter()
            .filter_map(|peer_id| self.players.get(&peer_id))
            .collect()
    }

    /// Peers whose players have been idle longer than the cutoff
    pub fn idle_players(&self, cutoff: std::time::Duration) -> Vec<PeerId> {
        self.players
            .iter()
            .filter(|(_, p)| p.idle_for() > cutoff)
            .map(|(id, _)| *id)
            .collect()
    }
}
