//! Player store port
//!
//! The narrow surface the server needs from a backing store. Schema,
//! pooling and migrations live entirely inside the adapter.

use parking_lot::Mutex;

/// Adapter-side failures. Counted by the queue worker, never fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store update failed: {0}")]
    Update(String),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// A persisted player row
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRecord {
    pub id: u64,
    pub username: String,
    pub level: i32,
    pub health: i32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Storage port. Position/stats updates run on the queue worker; the
/// username lookup is synchronous and reserved for the login cold path.
pub trait PlayerStore: Send + Sync {
    fn update_position(&self, player_id: u64, x: f64, y: f64, z: f64) -> Result<(), StoreError>;

    fn update_stats(&self, player_id: u64, level: i32, health: i32) -> Result<(), StoreError>;

    fn player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError>;
}

/// In-memory adapter. Backs tests and runs without a database; the applied
/// log records every successful write in arrival order.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<hashbrown::HashMap<u64, PlayerRecord>>,
    applied: Mutex<Vec<AppliedWrite>>,
    fail_updates: std::sync::atomic::AtomicBool,
}

/// One write as the adapter saw it, for inspection in tests
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedWrite {
    Position { player_id: u64, x: f64, y: f64, z: f64 },
    Stats { player_id: u64, level: i32, health: i32 },
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_row(&self, record: PlayerRecord) {
        self.rows.lock().insert(record.id, record);
    }

    pub fn applied_writes(&self) -> Vec<AppliedWrite> {
        self.applied.lock().clone()
    }

    /// Make subsequent updates fail, to exercise the error-counting path
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        if self.fail_updates.load(std::sync::atomic::Ordering::Relaxed) {
            Err(StoreError::Unavailable("simulated failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PlayerStore for MemoryStore {
    fn update_position(&self, player_id: u64, x: f64, y: f64, z: f64) -> Result<(), StoreError> {
        self.check_failure()?;

        let mut rows = self.rows.lock();
        if let Some(row) = rows.get_mut(&player_id) {
            row.x = x;
            row.y = y;
            row.z = z;
        }
        self.applied
            .lock()
            .push(AppliedWrite::Position { player_id, x, y, z });
        Ok(())
    }

    fn update_stats(&self, player_id: u64, level: i32, health: i32) -> Result<(), StoreError> {
        self.check_failure()?;

        let mut rows = self.rows.lock();
        if let Some(row) = rows.get_mut(&player_id) {
            row.level = level;
            row.health = health;
        }
        self.applied
            .lock()
            .push(AppliedWrite::Stats { player_id, level, health });
        Ok(())
    }

    fn player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|r| r.username == username)
            .cloned())
    }
}
