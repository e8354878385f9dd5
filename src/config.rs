use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the UDP socket to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of concurrently connected peers
    pub max_clients: usize,
    /// Simulation tick rate in Hz
    pub tick_rate: u32,
    /// Seconds between WORLD_STATE broadcasts
    pub state_broadcast_period: f32,
    /// Seconds between persistence snapshots
    pub persist_period: f32,
    /// Seconds between performance reports
    pub perf_report_period: f32,
    /// Bounded persistence queue capacity
    pub persist_queue_capacity: usize,
    /// Spatial grid cell size in world units
    pub cell_size: f32,
    /// Seconds between idle-player sweeps
    pub idle_cleanup_interval: f32,
    /// Seconds of inactivity before a player is swept from the world
    pub idle_timeout: f32,
    /// Anti-cheat tuning
    pub anticheat: AntiCheatConfig,
    /// Database connection string handed to the persistence adapter
    pub db_connection: Option<String>,
    /// Directory the script host loads game rules from
    pub scripts_path: Option<String>,
}

/// Anti-cheat thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct AntiCheatConfig {
    /// Maximum horizontal speed in units per second
    #[serde(default = "default_max_speed")]
    pub max_speed: f32,
    /// Maximum actions accepted inside a 1-second window
    #[serde(default = "default_max_actions")]
    pub max_actions_per_second: usize,
    /// Suspicious-action count that triggers a disconnect
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: u32,
}

fn default_max_speed() -> f32 {
    15.0
}

fn default_max_actions() -> usize {
    20
}

fn default_suspicious_threshold() -> u32 {
    10
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            max_speed: default_max_speed(),
            max_actions_per_second: default_max_actions(),
            suspicious_threshold: default_suspicious_threshold(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7777,
            max_clients: 32,
            tick_rate: 30,
            state_broadcast_period: 0.05,
            persist_period: 5.0,
            perf_report_period: 60.0,
            persist_queue_capacity: 1024,
            cell_size: 50.0,
            idle_cleanup_interval: 30.0,
            idle_timeout: 300.0,
            anticheat: AntiCheatConfig::default(),
            db_connection: None,
            scripts_path: None,
        }
    }
}

/// Subset of the config that may come from a JSON file
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    max_clients: Option<usize>,
    tick_rate: Option<u32>,
    state_broadcast_period: Option<f32>,
    persist_period: Option<f32>,
    persist_queue_capacity: Option<usize>,
    cell_size: Option<f32>,
    db_connection: Option<String>,
    scripts_path: Option<String>,
    #[serde(default)]
    anticheat: Option<AntiCheatConfig>,
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Merge an optional JSON config file over the current values
    pub fn merge_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let file: FileConfig = serde_json::from_str(&raw)?;

        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(max_clients) = file.max_clients {
            self.max_clients = max_clients;
        }
        if let Some(tick_rate) = file.tick_rate {
            self.tick_rate = tick_rate;
        }
        if let Some(period) = file.state_broadcast_period {
            self.state_broadcast_period = period;
        }
        if let Some(period) = file.persist_period {
            self.persist_period = period;
        }
        if let Some(capacity) = file.persist_queue_capacity {
            self.persist_queue_capacity = capacity;
        }
        if let Some(cell_size) = file.cell_size {
            self.cell_size = cell_size;
        }
        if let Some(conn) = file.db_connection {
            self.db_connection = Some(conn);
        }
        if let Some(path) = file.scripts_path {
            self.scripts_path = Some(path);
        }
        if let Some(anticheat) = file.anticheat {
            self.anticheat = anticheat;
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("GAME_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                if parsed > 0 {
                    self.port = parsed;
                } else {
                    tracing::warn!("GAME_PORT must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid GAME_PORT '{}', using default", port);
            }
        }

        if let Ok(max_clients) = std::env::var("GAME_MAX_CLIENTS") {
            if let Ok(parsed) = max_clients.parse::<usize>() {
                if parsed > 0 && parsed <= 4096 {
                    self.max_clients = parsed;
                } else {
                    tracing::warn!("GAME_MAX_CLIENTS must be 1-4096, using default");
                }
            } else {
                tracing::warn!("Invalid GAME_MAX_CLIENTS '{}', using default", max_clients);
            }
        }

        if let Ok(conn) = std::env::var("GAME_DB_CONNECTION") {
            self.db_connection = Some(conn);
        }

        if let Ok(path) = std::env::var("GAME_SCRIPTS_PATH") {
            self.scripts_path = Some(path);
        }
    }

    /// Seconds per tick
    pub fn tick_period(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port cannot be 0".to_string());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.tick_rate == 0 || self.tick_rate > 240 {
            return Err("tick_rate must be 1-240".to_string());
        }
        if self.state_broadcast_period <= 0.0 {
            return Err("state_broadcast_period must be positive".to_string());
        }
        if self.persist_period <= 0.0 {
            return Err("persist_period must be positive".to_string());
        }
        if self.cell_size <= 0.0 {
            return Err("cell_size must be positive".to_string());
        }
        if self.persist_queue_capacity == 0 {
            return Err("persist_queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
