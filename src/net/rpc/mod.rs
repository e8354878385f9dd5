//! Remote procedure calls: wire codec and handler dispatch

pub mod codec;

pub use codec::{decode_frame, encode_frame, RemoteCall, Variant};

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::net::peers::PeerId;

/// RPC failures
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("malformed RPC frame: {0}")]
    BadFrame(&'static str),
    #[error("RPC method id {0} is not registered")]
    UnknownMethod(u16),
    #[error("RPC registration conflict: {0}")]
    RegConflict(String),
    #[error("cannot encode RPC frame: {0}")]
    Encode(&'static str),
}

/// Server-side RPC handler. Receives the calling peer and decoded arguments.
pub type RpcHandler = Box<dyn FnMut(PeerId, &[Variant]) + Send>;

struct Method {
    name: String,
    handler: RpcHandler,
}

/// Method table plus routing. Registration happens once at startup; a
/// collision there is a configuration error and aborts initialization.
#[derive(Default)]
pub struct RpcDispatcher {
    by_id: HashMap<u16, Method>,
    id_by_name: HashMap<String, u16>,
    next_id: u16,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the next free method id
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: RpcHandler,
    ) -> Result<u16, RpcError> {
        let id = self.next_id;
        self.register_with_id(id, name, handler)?;
        Ok(id)
    }

    /// Register a handler under an explicit method id
    pub fn register_with_id(
        &mut self,
        id: u16,
        name: impl Into<String>,
        handler: RpcHandler,
    ) -> Result<(), RpcError> {
        let name = name.into();

        if self.by_id.contains_key(&id) {
            return Err(RpcError::RegConflict(format!(
                "method id {} is already taken",
                id
            )));
        }
        if self.id_by_name.contains_key(&name) {
            return Err(RpcError::RegConflict(format!(
                "method '{}' is already registered",
                name
            )));
        }

        info!("RPC registered: '{}' -> id {}", name, id);
        self.id_by_name.insert(name.clone(), id);
        self.by_id.insert(id, Method { name, handler });
        if id >= self.next_id {
            self.next_id = id + 1;
        }
        Ok(())
    }

    /// Route a decoded call to its handler
    pub fn dispatch(
        &mut self,
        peer: PeerId,
        method_id: u16,
        args: &[Variant],
    ) -> Result<(), RpcError> {
        let method = self
            .by_id
            .get_mut(&method_id)
            .ok_or(RpcError::UnknownMethod(method_id))?;

        debug!(
            "dispatching RPC '{}' (id {}) from peer {} with {} args",
            method.name,
            method_id,
            peer,
            args.len()
        );
        (method.handler)(peer, args);
        Ok(())
    }

    /// Decode a raw frame body and dispatch it
    pub fn handle_frame(&mut self, peer: PeerId, body: &[u8]) -> Result<(), RpcError> {
        let call = decode_frame(body)?;
        self.dispatch(peer, call.method_id, &call.args)
    }

    pub fn method_name(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(|m| m.name.as_str())
    }

    pub fn method_id(&self, name: &str) -> Option<u16> {
        self.id_by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
