//! Prometheus-compatible metrics endpoint
//!
//! Exposes server counters in Prometheus text format.
//! Default endpoint: http://localhost:9090/metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Metrics registry for the game server
#[derive(Debug)]
pub struct Metrics {
    pub connected_peers: AtomicU64,
    pub players: AtomicU64,

    pub tick_count: AtomicU64,
    pub tick_time_us: AtomicU64,

    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,

    pub rpc_calls: AtomicU64,
    pub rpc_bad_frames: AtomicU64,

    pub anticheat_flags: AtomicU64,
    pub anticheat_bans: AtomicU64,

    pub persist_applied: AtomicU64,
    pub persist_dropped: AtomicU64,
    pub persist_errors: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connected_peers: AtomicU64::new(0),
            players: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_bad_frames: AtomicU64::new(0),
            anticheat_flags: AtomicU64::new(0),
            anticheat_bans: AtomicU64::new(0),
            persist_applied: AtomicU64::new(0),
            persist_dropped: AtomicU64::new(0),
            persist_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_tick_time(&self, duration: Duration) {
        self.tick_time_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("outpost_connected_peers", "Connected transport peers", "gauge",
            self.connected_peers.load(Ordering::Relaxed));
        metric!("outpost_players", "Players in the world", "gauge",
            self.players.load(Ordering::Relaxed));

        metric!("outpost_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("outpost_tick_time_microseconds", "Last tick duration", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));

        metric!("outpost_packets_received_total", "Packets received", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("outpost_packets_sent_total", "Packets sent", "counter",
            self.packets_sent.load(Ordering::Relaxed));
        metric!("outpost_packets_dropped_total", "Packets dropped on send", "counter",
            self.packets_dropped.load(Ordering::Relaxed));

        metric!("outpost_rpc_calls_total", "Remote calls dispatched", "counter",
            self.rpc_calls.load(Ordering::Relaxed));
        metric!("outpost_rpc_bad_frames_total", "Malformed RPC frames", "counter",
            self.rpc_bad_frames.load(Ordering::Relaxed));

        metric!("outpost_anticheat_flags_total", "Anti-cheat violations flagged", "counter",
            self.anticheat_flags.load(Ordering::Relaxed));
        metric!("outpost_anticheat_bans_total", "Peers disconnected by anti-cheat", "counter",
            self.anticheat_bans.load(Ordering::Relaxed));

        metric!("outpost_persist_applied_total", "Persistence writes applied", "counter",
            self.persist_applied.load(Ordering::Relaxed));
        metric!("outpost_persist_dropped_total", "Persistence writes dropped (queue full)", "counter",
            self.persist_dropped.load(Ordering::Relaxed));
        metric!("outpost_persist_errors_total", "Persistence adapter errors", "counter",
            self.persist_errors.load(Ordering::Relaxed));

        metric!("outpost_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET /") {
                        let body = "OK";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
