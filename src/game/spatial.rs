//! Spatial hash grid over the (x, z) plane
//!
//! Divides the world into uniform cells and tracks which peers occupy each
//! one. Area and radius queries touch only the covering cells. Empty cells
//! are pruned so memory stays proportional to occupied cells.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::net::peers::PeerId;

/// Grid cell key: (floor(x / cell_size), floor(z / cell_size))
pub type CellKey = (i32, i32);

struct Cells {
    grid: HashMap<CellKey, Vec<PeerId>>,
    cell_of: HashMap<PeerId, CellKey>,
}

/// Hashed uniform grid. One reader-writer lock guards the whole index:
/// queries share it, mutations take it exclusively.
pub struct SpatialGrid {
    cell_size: f32,
    cells: RwLock<Cells>,
    queries: AtomicU64,
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            cells: RwLock::new(Cells {
                grid: HashMap::new(),
                cell_of: HashMap::new(),
            }),
            queries: AtomicU64::new(0),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[inline]
    fn cell_for(&self, x: f32, z: f32) -> CellKey {
        (
            (x / self.cell_size).floor() as i32,
            (z / self.cell_size).floor() as i32,
        )
    }

    /// Insert a peer at a position. A peer already present is moved instead.
    pub fn insert(&self, peer: PeerId, x: f32, z: f32) {
        let cell = self.cell_for(x, z);
        let mut cells = self.cells.write();

        if let Some(old) = cells.cell_of.get(&peer).copied() {
            if old == cell {
                return;
            }
            Self::remove_from_cell(&mut cells, peer, old);
        }

        cells.grid.entry(cell).or_default().push(peer);
        cells.cell_of.insert(peer, cell);
    }

    /// Remove a peer from the index. Idempotent.
    pub fn remove(&self, peer: PeerId) {
        let mut cells = self.cells.write();
        if let Some(cell) = cells.cell_of.remove(&peer) {
            Self::remove_from_cell(&mut cells, peer, cell);
        }
    }

    /// Move a peer to a new position. No-op when the cell is unchanged.
    pub fn update(&self, peer: PeerId, x: f32, z: f32) {
        let new_cell = self.cell_for(x, z);
        let mut cells = self.cells.write();

        let Some(old_cell) = cells.cell_of.get(&peer).copied() else {
            return;
        };
        if old_cell == new_cell {
            return;
        }

        Self::remove_from_cell(&mut cells, peer, old_cell);
        cells.grid.entry(new_cell).or_default().push(peer);
        cells.cell_of.insert(peer, new_cell);
    }

    fn remove_from_cell(cells: &mut Cells, peer: PeerId, cell: CellKey) {
        if let Some(occupants) = cells.grid.get_mut(&cell) {
            occupants.retain(|&p| p != peer);
            if occupants.is_empty() {
                cells.grid.remove(&cell);
            }
        }
    }

    /// All peers in the cells covering the disk of radius `r` around (x, z).
    /// Cell-granular: callers needing an exact radius filter by distance.
    pub fn query_radius(&self, x: f32, z: f32, radius: f32) -> Vec<PeerId> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let cell_radius = (radius / self.cell_size).ceil() as i32;
        let (cx, cz) = self.cell_for(x, z);
        let cells = self.cells.read();

        let mut result = Vec::new();
        for dx in -cell_radius..=cell_radius {
            for dz in -cell_radius..=cell_radius {
                if let Some(occupants) = cells.grid.get(&(cx + dx, cz + dz)) {
                    result.extend_from_slice(occupants);
                }
            }
        }
        result
    }

    /// All peers in the cells covering an axis-aligned box
    pub fn query_area(&self, min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Vec<PeerId> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let (min_cx, min_cz) = self.cell_for(min_x, min_z);
        let (max_cx, max_cz) = self.cell_for(max_x, max_z);
        let cells = self.cells.read();

        let mut result = Vec::new();
        for cx in min_cx..=max_cx {
            for cz in min_cz..=max_cz {
                if let Some(occupants) = cells.grid.get(&(cx, cz)) {
                    result.extend_from_slice(occupants);
                }
            }
        }
        result
    }

    /// The cell a peer currently occupies, if any
    pub fn cell_of(&self, peer: PeerId) -> Option<CellKey> {
        self.cells.read().cell_of.get(&peer).copied()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.cells.read().cell_of.contains_key(&peer)
    }

    /// Total area/radius queries served since construction
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of occupied cells
    pub fn occupied_cells(&self) -> usize {
        self.cells.read().grid.len()
    }

    pub fn len(&self) -> usize {
        self.cells.read().cell_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_query() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, 100.0, 100.0);

        let result = grid.query_radius(100.0, 100.0, 0.001);
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn test_tiny_radius_still_finds_occupant() {
        // Query with any epsilon radius covers at least the center cell
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, -12.0, 33.0);
        assert!(grid.query_radius(-12.0, 33.0, f32::EPSILON).contains(&1));
    }

    #[test]
    fn test_negative_coordinates_floor() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, -1.0, -1.0);
        assert_eq!(grid.cell_of(1), Some((-1, -1)));
    }

    #[test]
    fn test_query_radius_covers_ceil_cells() {
        let grid = SpatialGrid::new(50.0);
        // 120 / 50 ceils to 3 cells out; (150, 0) is 3 cells away from origin
        grid.insert(1, 150.0, 0.0);
        assert!(grid.query_radius(0.0, 0.0, 120.0).contains(&1));
        // 4 cells away must not be visited at this radius
        grid.insert(2, 210.0, 0.0);
        assert!(!grid.query_radius(0.0, 0.0, 120.0).contains(&2));
    }

    #[test]
    fn test_update_moves_between_cells() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, 0.0, 0.0);
        grid.update(1, 500.0, 500.0);

        assert!(!grid.query_radius(0.0, 0.0, 10.0).contains(&1));
        assert!(grid.query_radius(500.0, 500.0, 10.0).contains(&1));
        assert_eq!(grid.occupied_cells(), 1);
    }

    #[test]
    fn test_update_same_cell_is_noop() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, 10.0, 10.0);
        let before = grid.cell_of(1);
        grid.update(1, 12.0, 12.0);
        assert_eq!(grid.cell_of(1), before);
    }

    #[test]
    fn test_update_unknown_peer_is_noop() {
        let grid = SpatialGrid::new(50.0);
        grid.update(99, 0.0, 0.0);
        assert!(grid.is_empty());
    }

    #[test]
    fn test_empty_cells_pruned() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, 0.0, 0.0);
        grid.insert(2, 500.0, 0.0);
        assert_eq!(grid.occupied_cells(), 2);

        grid.remove(1);
        assert_eq!(grid.occupied_cells(), 1);

        grid.update(2, 0.0, 0.0);
        assert_eq!(grid.occupied_cells(), 1);
    }

    #[test]
    fn test_remove_idempotent() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, 0.0, 0.0);
        grid.remove(1);
        grid.remove(1);
        assert!(grid.is_empty());
        assert_eq!(grid.occupied_cells(), 0);
    }

    #[test]
    fn test_query_area() {
        let grid = SpatialGrid::new(50.0);
        grid.insert(1, 25.0, 25.0);
        grid.insert(2, 175.0, 25.0);
        grid.insert(3, -60.0, 25.0);

        let result = grid.query_area(0.0, 0.0, 100.0, 100.0);
        assert!(result.contains(&1));
        // Cell-granular: peer 2 sits in a cell outside the box
        assert!(!result.contains(&2));
        assert!(!result.contains(&3));
    }

    #[test]
    fn test_many_peers_one_cell() {
        let grid = SpatialGrid::new(50.0);
        for peer in 1..=10 {
            grid.insert(peer, 10.0, 10.0);
        }
        assert_eq!(grid.occupied_cells(), 1);
        assert_eq!(grid.query_radius(10.0, 10.0, 1.0).len(), 10);

        for peer in 1..=9 {
            grid.remove(peer);
        }
        assert_eq!(grid.query_radius(10.0, 10.0, 1.0), vec![10]);
    }

    #[test]
    fn test_concurrent_readers_with_writer() {
        use std::sync::Arc;

        let grid = Arc::new(SpatialGrid::new(50.0));
        for peer in 1..=100 {
            grid.insert(peer, (peer as f32) * 10.0, 0.0);
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let grid = grid.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _ = grid.query_radius(500.0, 0.0, 300.0);
                    }
                })
            })
            .collect();

        for peer in 1..=100 {
            grid.update(peer, (peer as f32) * 10.0, 100.0);
        }

        for handle in readers {
            handle.join().unwrap();
        }
        assert_eq!(grid.len(), 100);
    }
}
