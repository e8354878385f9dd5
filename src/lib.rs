//! Outpost game server library
//!
//! An authoritative multiplayer game server over UDP: reliable-datagram
//! sessions, a compact binary RPC protocol, a spatially indexed world,
//! behavioural anti-cheat and asynchronous persistence, all driven by a
//! fixed-rate tick loop.

pub mod anticheat;
pub mod config;
pub mod game;
pub mod metrics;
pub mod net;
pub mod persistence;
pub mod scripting;
pub mod server;
pub mod util;

pub use config::ServerConfig;
pub use server::GameServer;
