//! Game server: owns the subsystems and drives the fixed-rate tick loop
//!
//! The loop is the single owner of simulation state. Per tick it drains the
//! transport, routes events by type, advances the world, and on their own
//! accumulators broadcasts the authoritative snapshot, enqueues persistence
//! writes, sweeps idle players and reports performance. Nothing on this path
//! may abort the process; only initialization errors are fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::anticheat::AntiCheat;
use crate::config::ServerConfig;
use crate::game::performance::PerformanceMonitor;
use crate::game::player::Player;
use crate::game::world::World;
use crate::metrics::Metrics;
use crate::net::peers::PeerId;
use crate::net::protocol::{decode_move, PacketType, PlayerSnapshot, WorldSnapshot};
use crate::net::rpc::{RpcDispatcher, RpcError};
use crate::net::transport::{ReliableTransport, TransportEvent, TransportTuning};
use crate::persistence::{PersistenceQueue, PlayerStore};
use crate::scripting::{HookContext, Packet, ScriptHooks};

/// Transport drain timeout per tick
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Worker drain allowance during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct GameServer {
    config: ServerConfig,
    transport: ReliableTransport,
    world: World,
    anticheat: AntiCheat,
    rpc: RpcDispatcher,
    persistence: PersistenceQueue,
    hooks: Box<dyn ScriptHooks>,
    perf: PerformanceMonitor,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    state_accum: f32,
    persist_accum: f32,
    cleanup_accum: f32,
    last_report: Instant,
}

impl GameServer {
    /// Bind the transport and wire the subsystems together.
    /// Registration conflicts and bind failures abort initialization.
    pub async fn new(
        config: ServerConfig,
        store: Arc<dyn PlayerStore>,
        hooks: Box<dyn ScriptHooks>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        Self::new_with_tuning(config, store, hooks, metrics, TransportTuning::default()).await
    }

    pub async fn new_with_tuning(
        config: ServerConfig,
        store: Arc<dyn PlayerStore>,
        mut hooks: Box<dyn ScriptHooks>,
        metrics: Arc<Metrics>,
        tuning: TransportTuning,
    ) -> anyhow::Result<Self> {
        let transport = ReliableTransport::bind_with(
            config.bind_address,
            config.port,
            config.max_clients,
            tuning,
        )
        .await?;

        let mut rpc = RpcDispatcher::new();
        hooks.register_rpcs(&mut rpc)?;

        let persistence = PersistenceQueue::spawn(store, config.persist_queue_capacity);
        let world = World::new(config.cell_size);
        let anticheat = AntiCheat::new(config.anticheat.clone());
        let perf = PerformanceMonitor::new(config.tick_rate);

        info!(
            "server initialized on {} ({} Hz, max {} clients)",
            transport.local_addr(),
            config.tick_rate,
            config.max_clients
        );

        Ok(Self {
            config,
            transport,
            world,
            anticheat,
            rpc,
            persistence,
            hooks,
            perf,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
            state_accum: 0.0,
            persist_accum: 0.0,
            cleanup_accum: 0.0,
            last_report: Instant::now(),
        })
    }

    /// Flag checked once per tick; flipping it ends the loop after the
    /// current tick completes.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.transport.local_addr()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn anticheat(&self) -> &AntiCheat {
        &self.anticheat
    }

    pub fn persistence(&self) -> &PersistenceQueue {
        &self.persistence
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run until the shutdown flag flips, then tear down in order
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let tick_period = Duration::from_secs_f32(self.config.tick_period());
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("main loop started at {} Hz", self.config.tick_rate);
        let mut last = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            ticker.tick().await;
            let now = Instant::now();
            let dt = now.saturating_duration_since(last).as_secs_f32();
            last = now;

            self.step(dt).await;
        }

        info!("main loop ended");
        self.finalize();
        Ok(())
    }

    /// One simulation tick. Public so harnesses can drive the loop manually.
    pub async fn step(&mut self, dt: f32) {
        let started = Instant::now();
        self.perf.frame_start();

        let events = self.transport.poll(POLL_TIMEOUT).await;
        for event in events {
            self.route_event(event, dt);
        }

        self.world.update(dt);
        self.run_hook(|hooks, ctx| hooks.update_world(ctx, dt));

        self.state_accum += dt;
        if self.state_accum >= self.config.state_broadcast_period {
            self.broadcast_state();
            self.state_accum = 0.0;
        }

        self.persist_accum += dt;
        if self.persist_accum >= self.config.persist_period {
            self.persist_snapshot();
            self.persist_accum = 0.0;
        }

        self.cleanup_accum += dt;
        if self.cleanup_accum >= self.config.idle_cleanup_interval {
            self.sweep_idle_players();
            self.cleanup_accum = 0.0;
        }

        self.perf.set_connected_players(self.world.len());
        self.perf.set_spatial_queries(self.world.grid().query_count());
        self.perf.frame_end();
        self.publish_metrics(started.elapsed());

        if self.last_report.elapsed().as_secs_f32() >= self.config.perf_report_period {
            info!("performance: {}", self.perf.report());
            self.last_report = Instant::now();
        }
    }

    fn route_event(&mut self, event: TransportEvent, dt: f32) {
        match event {
            TransportEvent::Connect { peer } => {
                info!("client connected: {}", peer);
                self.run_hook(|hooks, ctx| hooks.on_player_connect(ctx, peer, ""));
            }
            TransportEvent::Disconnect { peer } => self.handle_peer_disconnect(peer),
            TransportEvent::Receive { peer, tag, body } => {
                self.perf.record_packet_received();
                self.metrics.packets_received.fetch_add(1, Ordering::Relaxed);
                self.route_packet(peer, tag, body, dt);
            }
        }
    }

    fn route_packet(&mut self, peer: PeerId, tag: u8, body: Vec<u8>, dt: f32) {
        match PacketType::from_u8(tag) {
            Some(PacketType::AuthRequest) => {
                self.run_hook(|hooks, ctx| hooks.handle_auth_request(ctx, peer, &body));
            }
            Some(PacketType::PlayerMove) => self.handle_player_move(peer, &body, dt),
            Some(PacketType::PlayerAction) => {
                if self.anticheat.validate_action(peer, "action") {
                    self.world.touch(peer);
                    self.run_hook(|hooks, ctx| {
                        hooks.handle_player_action(ctx, peer, Packet { tag, body: &body })
                    });
                } else {
                    self.metrics.anticheat_flags.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(PacketType::ChatMessage) => {
                self.world.touch(peer);
                self.run_hook(|hooks, ctx| {
                    hooks.handle_chat_message(ctx, peer, Packet { tag, body: &body })
                });
            }
            Some(PacketType::RemoteCall) => self.handle_remote_call(peer, &body),
            Some(PacketType::RpcCall) => {
                debug!("legacy RPC tag from peer {}", peer);
                self.handle_remote_call(peer, &body);
            }
            _ => {
                warn!("unknown packet type {} received from peer {}", tag, peer);
            }
        }
    }

    fn handle_player_move(&mut self, peer: PeerId, body: &[u8], dt: f32) {
        let Some(player) = self.world.get(peer) else {
            return;
        };
        let old = player.position;

        let new_pos = match decode_move(body) {
            Ok(pos) => pos,
            Err(e) => {
                warn!("invalid PLAYER_MOVE from peer {}: {}", peer, e);
                return;
            }
        };

        if !self
            .anticheat
            .validate_movement(peer, old.x, old.z, new_pos.x, new_pos.z, dt)
        {
            self.metrics.anticheat_flags.fetch_add(1, Ordering::Relaxed);
            if self.anticheat.should_ban(peer) {
                error!("banning peer {} for repeated violations", peer);
                self.metrics.anticheat_bans.fetch_add(1, Ordering::Relaxed);
                self.transport.disconnect(peer);
            }
            // Rejected move: the authoritative position stands
            return;
        }

        self.world.set_position(peer, new_pos);
        self.run_hook(|hooks, ctx| hooks.handle_player_move(ctx, peer, body));
    }

    fn handle_remote_call(&mut self, peer: PeerId, body: &[u8]) {
        match self.rpc.handle_frame(peer, body) {
            Ok(()) => {
                self.metrics.rpc_calls.fetch_add(1, Ordering::Relaxed);
            }
            Err(RpcError::UnknownMethod(id)) => {
                warn!("RPC not registered: id {} (peer {})", id, peer);
            }
            Err(e) => {
                self.metrics.rpc_bad_frames.fetch_add(1, Ordering::Relaxed);
                warn!("dropping RPC frame from peer {}: {}", peer, e);
            }
        }
    }

    fn handle_peer_disconnect(&mut self, peer: PeerId) {
        info!("client disconnected: {}", peer);
        let removed = self.world.remove(peer);
        self.anticheat.purge(peer);

        let username = removed.map(|p| p.username).unwrap_or_default();
        self.run_hook(|hooks, ctx| hooks.on_player_disconnect(ctx, peer, &username));
    }

    /// Emit the WORLD_STATE snapshot to every connected peer
    fn broadcast_state(&mut self) {
        let snapshot = WorldSnapshot {
            players: self.world.players().map(PlayerSnapshot::from_player).collect(),
        };

        match serde_json::to_vec(&snapshot) {
            Ok(body) => {
                if self
                    .transport
                    .broadcast(PacketType::WorldState as u8, &body, None)
                {
                    self.perf.record_packet_sent();
                    self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.perf.record_packet_dropped();
                    self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => error!("failed to encode world state: {}", e),
        }
    }

    /// Queue a position write for every live player
    fn persist_snapshot(&mut self) {
        for player in self.world.players() {
            self.persistence.enqueue_update_position(
                player.db_id,
                player.position.x as f64,
                player.position.y as f64,
                player.position.z as f64,
            );
        }
    }

    /// Drop players that have gone quiet. The peer connection stays open;
    /// only the world entry and anti-cheat state go away.
    fn sweep_idle_players(&mut self) {
        let cutoff = Duration::from_secs_f32(self.config.idle_timeout);
        for peer in self.world.idle_players(cutoff) {
            if let Some(player) = self.world.remove(peer) {
                info!("removing idle player {} (peer {})", player.username, peer);
            }
            self.anticheat.purge(peer);
        }
    }

    fn publish_metrics(&self, tick_time: Duration) {
        self.metrics.record_tick_time(tick_time);
        self.metrics
            .connected_peers
            .store(self.transport.connected_peers() as u64, Ordering::Relaxed);
        self.metrics
            .players
            .store(self.world.len() as u64, Ordering::Relaxed);
        self.metrics
            .persist_applied
            .store(self.persistence.applied_writes(), Ordering::Relaxed);
        self.metrics
            .persist_dropped
            .store(self.persistence.dropped_writes(), Ordering::Relaxed);
        self.metrics
            .persist_errors
            .store(self.persistence.adapter_errors(), Ordering::Relaxed);
    }

    fn run_hook<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn ScriptHooks, &mut HookContext<'_>) -> Result<(), crate::scripting::HookError>,
    {
        let mut ctx = HookContext {
            transport: &mut self.transport,
            world: &mut self.world,
            persistence: &self.persistence,
        };
        if let Err(e) = f(self.hooks.as_mut(), &mut ctx) {
            warn!("{}", e);
        }
    }

    /// Shutdown order: final snapshot, drain the worker, close the transport
    fn finalize(&mut self) {
        info!("shutting down server...");
        self.persist_snapshot();
        self.persistence.shutdown(DRAIN_TIMEOUT);
        self.transport.close();
        info!("performance: {}", self.perf.report());
        info!("server stopped");
    }

    /// Insert an authenticated player. The path hooks take via the context
    /// façade; exposed for embedding and tests.
    pub fn add_player(&mut self, player: Player) {
        self.world.add(player);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::scripting::NullHooks;
    use crate::util::Vec3;
    use std::net::{IpAddr, Ipv4Addr};

    async fn test_server() -> GameServer {
        let mut config = ServerConfig::default();
        config.bind_address = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        config.port = 0;

        GameServer::new(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(NullHooks),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap()
    }

    fn player(peer: PeerId, name: &str) -> Player {
        Player::new(peer, peer as u64 + 1000, name.to_string())
    }

    #[tokio::test]
    async fn test_step_runs_without_clients() {
        let mut server = test_server().await;
        for _ in 0..5 {
            server.step(1.0 / 30.0).await;
        }
        assert_eq!(server.metrics().tick_count.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_move_applies_position() {
        let mut server = test_server().await;
        server.add_player(player(1, "alice"));

        let body = crate::net::protocol::encode_move(Vec3::new(0.4, 0.0, 0.0));
        server.handle_player_move(1, &body, 1.0 / 30.0);

        assert_eq!(
            server.world().get(1).unwrap().position,
            Vec3::new(0.4, 0.0, 0.0)
        );
    }

    #[tokio::test]
    async fn test_move_for_unknown_peer_ignored() {
        let mut server = test_server().await;
        let body = crate::net::protocol::encode_move(Vec3::new(1.0, 0.0, 0.0));
        server.handle_player_move(9, &body, 1.0 / 30.0);
        assert!(server.world().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_move_dropped() {
        let mut server = test_server().await;
        server.add_player(player(1, "alice"));
        server.handle_player_move(1, &[1, 2, 3], 1.0 / 30.0);
        assert_eq!(server.world().get(1).unwrap().position, Vec3::ZERO);
    }

    #[tokio::test]
    async fn test_rejected_move_not_applied() {
        let mut server = test_server().await;
        server.add_player(player(1, "alice"));

        // One teleport: flagged, below the ban threshold, position stands
        let body = crate::net::protocol::encode_move(Vec3::new(1000.0, 0.0, 0.0));
        server.handle_player_move(1, &body, 1.0 / 30.0);

        assert_eq!(server.anticheat().suspicion(1), 1);
        assert_eq!(server.world().get(1).unwrap().position, Vec3::ZERO);
    }

    #[tokio::test]
    async fn test_repeated_speed_hack_bans() {
        let mut server = test_server().await;
        server.add_player(player(1, "cheater"));

        // The same oversized jump keeps failing because the rejected
        // position is never applied
        let body = crate::net::protocol::encode_move(Vec3::new(1000.0, 0.0, 0.0));
        for _ in 0..10 {
            server.handle_player_move(1, &body, 1.0 / 30.0);
        }

        assert!(server.anticheat().should_ban(1));
        assert_eq!(server.metrics().anticheat_bans.load(Ordering::Relaxed), 1);
        assert_eq!(server.world().get(1).unwrap().position, Vec3::ZERO);
    }

    #[tokio::test]
    async fn test_action_rate_limit_drops_actions() {
        let mut server = test_server().await;
        server.add_player(player(1, "spammer"));

        for _ in 0..25 {
            server.route_packet(1, PacketType::PlayerAction as u8, b"act".to_vec(), 1.0 / 30.0);
        }

        assert!(server.metrics().anticheat_flags.load(Ordering::Relaxed) > 0);
        assert!(server.anticheat().suspicion(1) > 0);
    }

    #[tokio::test]
    async fn test_disconnect_clears_player_and_anticheat() {
        let mut server = test_server().await;
        server.add_player(player(1, "alice"));
        server.anticheat.flag(1, "test");

        server.route_event(TransportEvent::Disconnect { peer: 1 }, 1.0 / 30.0);

        assert!(!server.world().contains(1));
        assert!(!server.world().grid().contains(1));
        assert_eq!(server.anticheat().suspicion(1), 0);
    }

    #[tokio::test]
    async fn test_unknown_tag_dropped() {
        let mut server = test_server().await;
        server.route_packet(1, 0x7F, vec![1, 2, 3], 1.0 / 30.0);
        // Nothing to assert beyond "did not panic"; state is untouched
        assert!(server.world().is_empty());
    }

    #[tokio::test]
    async fn test_bad_rpc_frame_counted() {
        let mut server = test_server().await;
        server.route_packet(1, PacketType::RemoteCall as u8, vec![], 1.0 / 30.0);
        assert_eq!(server.metrics().rpc_bad_frames.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_legacy_rpc_tag_shares_decode_path() {
        let mut server = test_server().await;
        server.route_packet(1, PacketType::RpcCall as u8, vec![], 1.0 / 30.0);
        assert_eq!(server.metrics().rpc_bad_frames.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_persist_snapshot_enqueues_all_players() {
        let mut server = test_server().await;
        server.add_player(player(1, "alice"));
        server.add_player(player(2, "bob"));

        server.persist_snapshot();

        // Both writes accepted by the bounded queue
        assert_eq!(server.persistence().dropped_writes(), 0);
    }

    #[tokio::test]
    async fn test_persist_accumulator_fires_on_period() {
        let mut server = test_server().await;
        server.config.persist_period = 0.1;
        server.add_player(player(1, "alice"));

        server.step(0.06).await;
        server.step(0.06).await;

        std::thread::sleep(Duration::from_millis(50));
        assert!(server.persistence().applied_writes() >= 1);
    }

    #[tokio::test]
    async fn test_idle_sweep_removes_player_keeps_peer_open() {
        let mut server = test_server().await;
        server.config.idle_timeout = 0.0;
        server.add_player(player(1, "sleeper"));

        std::thread::sleep(Duration::from_millis(5));
        server.sweep_idle_players();

        assert!(!server.world().contains(1));
        assert!(!server.world().grid().contains(1));
    }

    #[tokio::test]
    async fn test_hook_failure_tolerated() {
        struct FailingHooks;
        impl ScriptHooks for FailingHooks {
            fn update_world(
                &mut self,
                _ctx: &mut HookContext<'_>,
                _dt: f32,
            ) -> Result<(), crate::scripting::HookError> {
                Err(crate::scripting::HookError::new("boom"))
            }
        }

        let mut config = ServerConfig::default();
        config.bind_address = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        config.port = 0;

        let mut server = GameServer::new(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(FailingHooks),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();

        // The failing hook must not take the loop down
        server.step(1.0 / 30.0).await;
        server.step(1.0 / 30.0).await;
    }

    #[tokio::test]
    async fn test_rpc_registration_conflict_fails_init() {
        struct ConflictingHooks;
        impl ScriptHooks for ConflictingHooks {
            fn register_rpcs(&mut self, rpc: &mut RpcDispatcher) -> Result<(), RpcError> {
                rpc.register_with_id(5, "shoot", Box::new(|_, _| {}))?;
                rpc.register_with_id(5, "other", Box::new(|_, _| {}))?;
                Ok(())
            }
        }

        let mut config = ServerConfig::default();
        config.bind_address = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        config.port = 0;

        let result = GameServer::new(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(ConflictingHooks),
            Arc::new(Metrics::new()),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flag_ends_run() {
        let mut server = test_server().await;
        let flag = server.shutdown_handle();

        let start = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            flag.store(true, Ordering::Relaxed);
        });

        server.run().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
