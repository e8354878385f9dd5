//! Performance accounting for the tick loop
//!
//! Tracks frame durations in a rolling window plus packet and query
//! counters, and renders the periodic human-readable report.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling samples kept for timing statistics (~4 s at 30 Hz)
const MAX_SAMPLES: usize = 120;

pub struct PerformanceMonitor {
    frame_durations: VecDeque<Duration>,
    target_frame: Duration,
    frame_start: Option<Instant>,
    frames: u64,
    packets_received: u64,
    packets_sent: u64,
    packets_dropped: u64,
    spatial_queries: u64,
    connected_players: usize,
}

impl PerformanceMonitor {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            frame_durations: VecDeque::with_capacity(MAX_SAMPLES),
            target_frame: Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32),
            frame_start: None,
            frames: 0,
            packets_received: 0,
            packets_sent: 0,
            packets_dropped: 0,
            spatial_queries: 0,
            connected_players: 0,
        }
    }

    pub fn frame_start(&mut self) {
        self.frame_start = Some(Instant::now());
    }

    pub fn frame_end(&mut self) {
        if let Some(start) = self.frame_start.take() {
            self.record_frame(start.elapsed());
        }
    }

    fn record_frame(&mut self, duration: Duration) {
        self.frames += 1;
        self.frame_durations.push_back(duration);
        while self.frame_durations.len() > MAX_SAMPLES {
            self.frame_durations.pop_front();
        }
    }

    pub fn record_packet_received(&mut self) {
        self.packets_received += 1;
    }

    pub fn record_packet_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn record_packet_dropped(&mut self) {
        self.packets_dropped += 1;
    }

    pub fn set_spatial_queries(&mut self, total: u64) {
        self.spatial_queries = total;
    }

    pub fn set_connected_players(&mut self, count: usize) {
        self.connected_players = count;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    pub fn average_frame(&self) -> Duration {
        if self.frame_durations.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.frame_durations.iter().sum();
        sum / self.frame_durations.len() as u32
    }

    pub fn p95_frame(&self) -> Duration {
        if self.frame_durations.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.frame_durations.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn max_frame(&self) -> Duration {
        self.frame_durations.iter().max().copied().unwrap_or(Duration::ZERO)
    }

    /// Average frame time as a fraction of the tick budget, in percent
    pub fn budget_usage_percent(&self) -> f32 {
        self.average_frame().as_secs_f32() / self.target_frame.as_secs_f32() * 100.0
    }

    /// One-line report for the periodic log
    pub fn report(&self) -> String {
        format!(
            "frames={} avg={:.2}ms p95={:.2}ms max={:.2}ms budget={:.1}% players={} rx={} tx={} dropped={} queries={}",
            self.frames,
            self.average_frame().as_secs_f64() * 1000.0,
            self.p95_frame().as_secs_f64() * 1000.0,
            self.max_frame().as_secs_f64() * 1000.0,
            self.budget_usage_percent(),
            self.connected_players,
            self.packets_received,
            self.packets_sent,
            self.packets_dropped,
            self.spatial_queries,
        )
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(30)
    }
}
