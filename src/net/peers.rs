//! Peer registry: stable peer ids for transport endpoints
//!
//! Ids start at 1, increase monotonically and are never reused within a
//! server run. An endpoint maps to exactly one id and vice versa.

use std::net::SocketAddr;

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Stable identifier for a connected peer
pub type PeerId = u32;

/// Errors from peer registration
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("endpoint {0} is already attached")]
    AlreadyAttached(SocketAddr),
    #[error("registry is full ({0} peers)")]
    Full(usize),
}

struct Inner {
    next_id: PeerId,
    by_addr: HashMap<SocketAddr, PeerId>,
    by_id: HashMap<PeerId, SocketAddr>,
}

/// Bidirectional endpoint <-> peer id lookup.
///
/// Writers serialize on the lock; readers may be concurrent.
pub struct PeerRegistry {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Inner {
                next_id: 1,
                by_addr: HashMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Assign the next peer id to an endpoint
    pub fn attach(&self, addr: SocketAddr) -> Result<PeerId, RegistryError> {
        let mut inner = self.inner.write();

        if inner.by_addr.contains_key(&addr) {
            return Err(RegistryError::AlreadyAttached(addr));
        }
        if inner.by_addr.len() >= self.capacity {
            return Err(RegistryError::Full(self.capacity));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_addr.insert(addr, id);
        inner.by_id.insert(id, addr);
        Ok(id)
    }

    /// Remove an endpoint. Idempotent; returns the id it held, if any.
    pub fn detach(&self, addr: SocketAddr) -> Option<PeerId> {
        let mut inner = self.inner.write();
        if let Some(id) = inner.by_addr.remove(&addr) {
            inner.by_id.remove(&id);
            Some(id)
        } else {
            None
        }
    }

    /// Remove a peer by id. Idempotent; returns its endpoint, if any.
    pub fn detach_id(&self, peer: PeerId) -> Option<SocketAddr> {
        let mut inner = self.inner.write();
        if let Some(addr) = inner.by_id.remove(&peer) {
            inner.by_addr.remove(&addr);
            Some(addr)
        } else {
            None
        }
    }

    pub fn lookup(&self, peer: PeerId) -> Option<SocketAddr> {
        self.inner.read().by_id.get(&peer).copied()
    }

    pub fn reverse(&self, addr: SocketAddr) -> Option<PeerId> {
        self.inner.read().by_addr.get(&addr).copied()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.inner.read().by_id.contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all connected peer ids
    pub fn ids(&self) -> Vec<PeerId> {
        self.inner.read().by_id.keys().copied().collect()
    }
}
