//! Asynchronous persistence: bounded queue + dedicated worker
//!
//! The simulation enqueues writes without blocking; a single worker thread
//! owns the store session and applies them in FIFO order. When the queue is
//! full the write is dropped and counted; the periodic snapshot re-submits
//! positions on its own schedule, so a dropped write heals itself.

pub mod store;

pub use store::{MemoryStore, PlayerRecord, PlayerStore, StoreError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{error, info, warn};

/// A pending write, applied by the worker in submission order
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Position { player_id: u64, x: f64, y: f64, z: f64 },
    Stats { player_id: u64, level: i32, health: i32 },
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Handle owned by the simulation side. Enqueue never blocks.
pub struct PersistenceQueue {
    tx: Option<Sender<WriteOp>>,
    counters: Arc<Counters>,
    done_rx: Receiver<()>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl PersistenceQueue {
    /// Start the worker thread over the given store
    pub fn spawn(store: Arc<dyn PlayerStore>, capacity: usize) -> Self {
        let (tx, rx) = bounded::<WriteOp>(capacity);
        let (done_tx, done_rx) = bounded::<()>(1);
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        let worker = std::thread::Builder::new()
            .name("persistence".to_string())
            .spawn(move || {
                info!("persistence worker started");
                for op in rx.iter() {
                    let result = match &op {
                        WriteOp::Position { player_id, x, y, z } => {
                            store.update_position(*player_id, *x, *y, *z)
                        }
                        WriteOp::Stats { player_id, level, health } => {
                            store.update_stats(*player_id, *level, *health)
                        }
                    };

                    match result {
                        Ok(()) => {
                            worker_counters.applied.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_counters.errors.fetch_add(1, Ordering::Relaxed);
                            error!("persistence write failed: {}", e);
                        }
                    }
                }
                info!("persistence worker stopped");
                let _ = done_tx.send(());
            })
            .expect("failed to spawn persistence worker");

        Self {
            tx: Some(tx),
            counters,
            done_rx,
            worker: Some(worker),
        }
    }

    /// Queue a position write. Returns false when the queue is full and the
    /// write was dropped.
    pub fn enqueue_update_position(&self, player_id: u64, x: f64, y: f64, z: f64) -> bool {
        self.push(WriteOp::Position { player_id, x, y, z })
    }

    /// Queue a level/health write. Returns false when dropped.
    pub fn enqueue_update_stats(&self, player_id: u64, level: i32, health: i32) -> bool {
        self.push(WriteOp::Stats { player_id, level, health })
    }

    fn push(&self, op: WriteOp) -> bool {
        let Some(tx) = &self.tx else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match tx.try_send(op) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn applied_writes(&self) -> u64 {
        self.counters.applied.load(Ordering::Relaxed)
    }

    pub fn dropped_writes(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn adapter_errors(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    /// Stop accepting writes and wait up to `drain_timeout` for the worker to
    /// finish the backlog. The worker is detached if it does not drain in
    /// time. Idempotent; later enqueues count as dropped.
    pub fn shutdown(&mut self, drain_timeout: Duration) {
        if self.tx.is_none() && self.worker.is_none() {
            return;
        }
        self.tx.take();

        match self.done_rx.recv_timeout(drain_timeout) {
            Ok(()) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
            }
            Err(_) => {
                warn!(
                    "persistence worker did not drain within {:?}, detaching",
                    drain_timeout
                );
                self.worker.take();
            }
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::AppliedWrite;

    #[test]
    fn test_fifo_order_preserved() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PersistenceQueue::spawn(store.clone(), 2048);

        for i in 0..1000 {
            assert!(queue.enqueue_update_position(7, i as f64, 0.0, 0.0));
        }
        queue.shutdown(Duration::from_secs(1));

        let applied = store.applied_writes();
        assert_eq!(applied.len(), 1000);
        for (i, write) in applied.iter().enumerate() {
            match write {
                AppliedWrite::Position { player_id, x, .. } => {
                    assert_eq!(*player_id, 7);
                    assert_eq!(*x, i as f64);
                }
                other => panic!("unexpected write {:?}", other),
            }
        }
    }

    #[test]
    fn test_mixed_ops_in_order() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PersistenceQueue::spawn(store.clone(), 16);

        queue.enqueue_update_position(1, 1.0, 0.0, 0.0);
        queue.enqueue_update_stats(1, 2, 90);
        queue.enqueue_update_position(1, 2.0, 0.0, 0.0);
        queue.shutdown(Duration::from_secs(1));

        let applied = store.applied_writes();
        assert_eq!(applied.len(), 3);
        assert!(matches!(applied[0], AppliedWrite::Position { x, .. } if x == 1.0));
        assert!(matches!(applied[1], AppliedWrite::Stats { level: 2, health: 90, .. }));
        assert!(matches!(applied[2], AppliedWrite::Position { x, .. } if x == 2.0));
    }

    #[test]
    fn test_queue_full_drops_and_counts() {
        let store = Arc::new(MemoryStore::new());
        // Stall the worker so the queue can fill
        store.set_fail_updates(false);
        let blocking_store = Arc::new(SlowStore {
            inner: store.clone(),
            delay: Duration::from_millis(50),
        });
        let mut queue = PersistenceQueue::spawn(blocking_store, 4);

        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..64 {
            if queue.enqueue_update_position(1, i as f64, 0.0, 0.0) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        assert!(rejected > 0, "queue of 4 cannot absorb 64 instant writes");
        assert_eq!(queue.dropped_writes(), rejected);
        assert_eq!(accepted + rejected, 64);

        queue.shutdown(Duration::from_secs(5));
        assert_eq!(store.applied_writes().len() as u64, accepted);
    }

    #[test]
    fn test_adapter_errors_counted_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_updates(true);
        let mut queue = PersistenceQueue::spawn(store.clone(), 16);

        queue.enqueue_update_position(1, 1.0, 0.0, 0.0);
        queue.enqueue_update_position(1, 2.0, 0.0, 0.0);

        // Worker keeps running through failures
        std::thread::sleep(Duration::from_millis(50));
        store.set_fail_updates(false);
        queue.enqueue_update_position(1, 3.0, 0.0, 0.0);
        queue.shutdown(Duration::from_secs(1));

        assert_eq!(queue.adapter_errors(), 2);
        assert_eq!(store.applied_writes().len(), 1);
    }

    #[test]
    fn test_shutdown_drains_backlog() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PersistenceQueue::spawn(store.clone(), 512);

        for i in 0..100 {
            queue.enqueue_update_position(3, i as f64, 0.0, 0.0);
        }
        queue.shutdown(Duration::from_secs(1));

        assert_eq!(store.applied_writes().len(), 100);
    }

    #[test]
    fn test_counters_start_zero() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PersistenceQueue::spawn(store, 16);
        assert_eq!(queue.applied_writes(), 0);
        assert_eq!(queue.dropped_writes(), 0);
        assert_eq!(queue.adapter_errors(), 0);
        queue.shutdown(Duration::from_secs(1));
    }

    /// Store wrapper that sleeps per write, for backpressure tests
    struct SlowStore {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    impl PlayerStore for SlowStore {
        fn update_position(&self, player_id: u64, x: f64, y: f64, z: f64) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.update_position(player_id, x, y, z)
        }

        fn update_stats(&self, player_id: u64, level: i32, health: i32) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.update_stats(player_id, level, health)
        }

        fn player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError> {
            self.inner.player_by_username(username)
        }
    }
}
