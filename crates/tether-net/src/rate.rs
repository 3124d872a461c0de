//! Rate heuristics: exponential-moving-average estimators for byte and
//! packet rates, fed by discrete event sizes.
//!
//! Each estimator keeps an `(estimate, last_update)` pair. Writes fold the
//! decayed old estimate together with the new event magnitude; reads return
//! a decayed view without mutating. Metric groups live behind a
//! reader/writer lock: many readers, one writer.

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default averaging window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// RateHeuristic
// ---------------------------------------------------------------------------

/// EMA estimator for a rate (units/second) built from discrete events.
#[derive(Debug, Clone)]
pub struct RateHeuristic {
    estimate: f32,
    last_update: Instant,
    window_secs: f32,
}

impl RateHeuristic {
    /// New estimator with the default 1-second window.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// New estimator with a custom averaging window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            estimate: 0.0,
            last_update: Instant::now(),
            window_secs: window.as_secs_f32().max(f32::EPSILON),
        }
    }

    /// Fold one event of the given magnitude into the estimate.
    ///
    /// Returns the updated rate. With events of magnitude `m` arriving `r`
    /// times per second, the estimate converges to roughly `m * r`.
    pub fn observe(&mut self, now: Instant, magnitude: f32) -> f32 {
        self.estimate = self.decayed(now) + magnitude / self.window_secs;
        self.last_update = now;
        self.estimate
    }

    /// Current decayed rate, without mutating.
    pub fn current(&self, now: Instant) -> f32 {
        self.decayed(now)
    }

    fn decayed(&self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f32();
        self.estimate * (-elapsed / self.window_secs).exp()
    }
}

impl Default for RateHeuristic {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RatePair / RateMetrics
// ---------------------------------------------------------------------------

/// One metric group: byte rate and packet rate for a single direction of a
/// single channel.
#[derive(Debug, Clone, Default)]
pub struct RatePair {
    /// Bytes per second.
    pub bytes: RateHeuristic,
    /// Packets per second.
    pub packets: RateHeuristic,
}

/// Thread-safe metric group. Readers take the shared lock, writers the
/// exclusive one.
#[derive(Debug, Default)]
pub struct RateMetrics {
    inner: RwLock<RatePair>,
}

impl RateMetrics {
    /// Create a zeroed metric group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event (`bytes` wire bytes, `packets` packets) into the group.
    pub fn observe(&self, bytes: f32, packets: f32) {
        let now = Instant::now();
        let mut pair = self.inner.write().unwrap_or_else(|e| e.into_inner());
        pair.bytes.observe(now, bytes);
        pair.packets.observe(now, packets);
    }

    /// Current decayed `(bytes/sec, packets/sec)`.
    pub fn current(&self) -> (f32, f32) {
        let now = Instant::now();
        let pair = self.inner.read().unwrap_or_else(|e| e.into_inner());
        (pair.bytes.current(now), pair.packets.current(now))
    }

    /// Current decayed byte rate.
    pub fn byte_rate(&self) -> f32 {
        self.current().0
    }

    /// Current decayed packet rate.
    pub fn packet_rate(&self) -> f32 {
        self.current().1
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
