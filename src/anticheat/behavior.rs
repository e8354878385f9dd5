use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::warn;

use crate::config::AntiCheatConfig;
use crate::net::peers::PeerId;

/// Violations detected by the anti-cheat checks
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheatViolation {
    #[error("action rate exceeded: {0} actions this second")]
    ActionRateExceeded(usize),
    #[error("speed hack detected: {0:.1} units/s")]
    SpeedHack(f32),
}

/// Sliding window for the per-second action rate check
const ACTION_WINDOW: Duration = Duration::from_secs(1);

/// Behavioural state for one peer, created lazily on first action
#[derive(Debug)]
pub struct PlayerBehavior {
    action_timestamps: VecDeque<Instant>,
    last_position: Option<(f32, f32)>,
    last_movement: Option<Instant>,
    suspicious_actions: u32,
}

impl PlayerBehavior {
    fn new() -> Self {
        Self {
            action_timestamps: VecDeque::new(),
            last_position: None,
            last_movement: None,
            suspicious_actions: 0,
        }
    }

    pub fn suspicious_actions(&self) -> u32 {
        self.suspicious_actions
    }

    pub fn last_position(&self) -> Option<(f32, f32)> {
        self.last_position
    }

    pub fn last_movement(&self) -> Option<Instant> {
        self.last_movement
    }
}

/// Per-peer behaviour tracking and validation
pub struct AntiCheat {
    config: AntiCheatConfig,
    behaviors: HashMap<PeerId, PlayerBehavior>,
}

impl AntiCheat {
    pub fn new(config: AntiCheatConfig) -> Self {
        Self {
            config,
            behaviors: HashMap::new(),
        }
    }

    /// Validate an action against the per-second rate limit.
    /// A rejected action is flagged and should be dropped by the caller.
    pub fn validate_action(&mut self, peer: PeerId, action_type: &str) -> bool {
        self.validate_action_at(peer, action_type, Instant::now())
    }

    fn validate_action_at(&mut self, peer: PeerId, action_type: &str, now: Instant) -> bool {
        let behavior = self.behaviors.entry(peer).or_insert_with(PlayerBehavior::new);

        behavior.action_timestamps.push_back(now);
        if let Some(cutoff) = now.checked_sub(ACTION_WINDOW) {
            while behavior
                .action_timestamps
                .front()
                .is_some_and(|&ts| ts < cutoff)
            {
                behavior.action_timestamps.pop_front();
            }
        }

        if behavior.action_timestamps.len() > self.config.max_actions_per_second {
            let count = behavior.action_timestamps.len();
            self.flag_with(
                peer,
                &format!("{} ({})", CheatViolation::ActionRateExceeded(count), action_type),
            );
            return false;
        }

        true
    }

    /// Validate a movement against the speed limit over (x, z).
    /// `dt <= 0` counts as zero speed; state still updates on acceptance.
    pub fn validate_movement(
        &mut self,
        peer: PeerId,
        old_x: f32,
        old_z: f32,
        new_x: f32,
        new_z: f32,
        dt: f32,
    ) -> bool {
        let dx = new_x - old_x;
        let dz = new_z - old_z;
        let distance = (dx * dx + dz * dz).sqrt();
        let speed = if dt > 0.0 { distance / dt } else { 0.0 };

        if speed > self.config.max_speed {
            self.flag_with(peer, &CheatViolation::SpeedHack(speed).to_string());
            warn!("peer {} moving too fast: {:.1} units/s", peer, speed);
            return false;
        }

        let behavior = self.behaviors.entry(peer).or_insert_with(PlayerBehavior::new);
        behavior.last_position = Some((new_x, new_z));
        behavior.last_movement = Some(Instant::now());
        true
    }

    /// Increment a peer's suspicion counter
    pub fn flag(&mut self, peer: PeerId, reason: &str) {
        self.flag_with(peer, reason);
    }

    fn flag_with(&mut self, peer: PeerId, reason: &str) {
        let behavior = self.behaviors.entry(peer).or_insert_with(PlayerBehavior::new);
        behavior.suspicious_actions += 1;
        warn!(
            "suspicious activity from peer {}: {} (total: {})",
            peer, reason, behavior.suspicious_actions
        );
    }

    /// True once the suspicion counter reaches the configured threshold
    pub fn should_ban(&self, peer: PeerId) -> bool {
        self.behaviors
            .get(&peer)
            .is_some_and(|b| b.suspicious_actions >= self.config.suspicious_threshold)
    }

    pub fn suspicion(&self, peer: PeerId) -> u32 {
        self.behaviors
            .get(&peer)
            .map_or(0, |b| b.suspicious_actions)
    }

    /// Drop all state for a disconnected peer
    pub fn purge(&mut self, peer: PeerId) {
        self.behaviors.remove(&peer);
    }

    pub fn tracked_peers(&self) -> usize {
        self.behaviors.len()
    }
}
