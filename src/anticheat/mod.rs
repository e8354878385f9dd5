//! Anti-cheat: per-peer behavioural validation
//!
//! Tracks action rates and movement speed per peer and accumulates a
//! suspicion counter. The tick loop consults `should_ban` before dropping a
//! connection; individual failures only reject the offending input.

pub mod behavior;

pub use behavior::{AntiCheat, CheatViolation, PlayerBehavior};
