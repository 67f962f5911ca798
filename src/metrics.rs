// Runtime metrics module
//
// Lock-free counters for the control loop, logged as a summary on shutdown

use crate::models::MissionOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide automation counters.
///
/// Uses atomic operations so every loop can record without locking.
#[derive(Debug)]
pub struct Metrics {
    /// Frames successfully captured
    pub frames_captured: AtomicU64,

    /// Capture, tap or swipe calls that failed
    pub device_failures: AtomicU64,

    /// Commands accepted by the queued path
    pub taps_queued: AtomicU64,

    /// Commands the queued worker actually sent
    pub queued_executed: AtomicU64,

    /// Queued commands skipped because their loop was cancelled
    pub queued_dropped: AtomicU64,

    /// Taps issued through the immediate path
    pub immediate_taps: AtomicU64,

    /// Labels that were expected but not found above threshold
    pub perception_misses: AtomicU64,

    /// Mission outcomes, indexed like `MissionOutcome::ALL`
    missions: [AtomicU64; 6],

    pub watchdog_refocus: AtomicU64,
    pub watchdog_restarts: AtomicU64,

    /// Application start time
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            device_failures: AtomicU64::new(0),
            taps_queued: AtomicU64::new(0),
            queued_executed: AtomicU64::new(0),
            queued_dropped: AtomicU64::new(0),
            immediate_taps: AtomicU64::new(0),
            perception_misses: AtomicU64::new(0),
            missions: Default::default(),
            watchdog_refocus: AtomicU64::new(0),
            watchdog_restarts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_frame(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_failure(&self) {
        self.device_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tap_queued(&self) {
        self.taps_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued_executed(&self) {
        self.queued_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued_dropped(&self) {
        self.queued_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_immediate_tap(&self) {
        self.immediate_taps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_perception_miss(&self) {
        self.perception_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mission(&self, outcome: MissionOutcome) {
        let idx = MissionOutcome::ALL
            .iter()
            .position(|o| *o == outcome)
            .unwrap_or(0);
        self.missions[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn missions(&self, outcome: MissionOutcome) -> u64 {
        MissionOutcome::ALL
            .iter()
            .position(|o| *o == outcome)
            .map_or(0, |i| self.missions[i].load(Ordering::Relaxed))
    }

    pub fn record_watchdog_refocus(&self) {
        self.watchdog_refocus.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watchdog_restart(&self) {
        self.watchdog_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Automation Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Frames: {} captured, {} device failures, {} perception misses",
            self.frames_captured.load(Ordering::Relaxed),
            self.device_failures.load(Ordering::Relaxed),
            self.perception_misses.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Taps: {} queued, {} sent by worker, {} cancelled, {} immediate",
            self.taps_queued.load(Ordering::Relaxed),
            self.queued_executed.load(Ordering::Relaxed),
            self.queued_dropped.load(Ordering::Relaxed),
            self.immediate_taps.load(Ordering::Relaxed)
        );
        let outcomes: Vec<String> = MissionOutcome::ALL
            .iter()
            .map(|o| format!("{}={}", o, self.missions(*o)))
            .collect();
        tracing::info!("Missions: {}", outcomes.join(", "));
        tracing::info!(
            "Watchdog: {} refocus, {} restarts",
            self.watchdog_refocus.load(Ordering::Relaxed),
            self.watchdog_restarts.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
