//! Script hook port
//!
//! The narrow façade between the core and external game-rule logic. The
//! core invokes hooks as events occur; hooks call back only through the
//! `HookContext` surface handed to them. A missing or failing hook is
//! logged and tolerated, never fatal.
//!
//! Hooks run on the simulation thread and must return promptly.

use tracing::debug;

use crate::game::world::World;
use crate::net::peers::PeerId;
use crate::net::rpc::{RpcDispatcher, RpcError};
use crate::net::transport::ReliableTransport;
use crate::persistence::PersistenceQueue;

/// A hook failure. Carried back to the core, which logs and continues.
#[derive(Debug, Clone, thiserror::Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Borrowed view of an inbound packet for action/chat hooks
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub tag: u8,
    pub body: &'a [u8],
}

/// The façade hooks may call back into
pub struct HookContext<'a> {
    pub transport: &'a mut ReliableTransport,
    pub world: &'a mut World,
    pub persistence: &'a PersistenceQueue,
}

/// Callbacks into the external rule logic. Every method has a tolerant
/// default so partial hook sets are valid.
#[allow(unused_variables)]
pub trait ScriptHooks: Send {
    /// One-shot registration pass at startup. Conflicts abort initialization.
    fn register_rpcs(&mut self, rpc: &mut RpcDispatcher) -> Result<(), RpcError> {
        Ok(())
    }

    fn handle_auth_request(
        &mut self,
        ctx: &mut HookContext<'_>,
        peer: PeerId,
        body: &[u8],
    ) -> Result<(), HookError> {
        debug!("no auth handler registered; ignoring request from peer {}", peer);
        Ok(())
    }

    fn handle_player_move(
        &mut self,
        ctx: &mut HookContext<'_>,
        peer: PeerId,
        body: &[u8],
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn handle_player_action(
        &mut self,
        ctx: &mut HookContext<'_>,
        peer: PeerId,
        packet: Packet<'_>,
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn handle_chat_message(
        &mut self,
        ctx: &mut HookContext<'_>,
        peer: PeerId,
        packet: Packet<'_>,
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn update_world(&mut self, ctx: &mut HookContext<'_>, dt: f32) -> Result<(), HookError> {
        Ok(())
    }

    fn on_player_connect(
        &mut self,
        ctx: &mut HookContext<'_>,
        peer: PeerId,
        username: &str,
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn on_player_disconnect(
        &mut self,
        ctx: &mut HookContext<'_>,
        peer: PeerId,
        username: &str,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hook set that does nothing. Used when no script host is wired in.
pub struct NullHooks;

impl ScriptHooks for NullHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_hooks_register_nothing() {
        let mut rpc = RpcDispatcher::new();
        NullHooks.register_rpcs(&mut rpc).unwrap();
        assert!(rpc.is_empty());
    }

    #[test]
    fn test_hook_error_display() {
        let err = HookError::new("script blew up");
        assert_eq!(err.to_string(), "hook failed: script blew up");
    }

    #[test]
    fn test_default_hooks_tolerate_everything() {
        struct Partial;
        impl ScriptHooks for Partial {
            fn update_world(
                &mut self,
                _ctx: &mut HookContext<'_>,
                _dt: f32,
            ) -> Result<(), HookError> {
                Err(HookError::new("only hook present, and it fails"))
            }
        }

        // A hook set overriding a single method still satisfies the trait;
        // the rest resolve to the tolerant defaults.
        let mut hooks: Box<dyn ScriptHooks> = Box::new(Partial);
        let mut rpc = RpcDispatcher::new();
        assert!(hooks.register_rpcs(&mut rpc).is_ok());
    }
}
