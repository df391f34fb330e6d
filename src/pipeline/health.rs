//! Per-session health counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for one client session
///
/// All fields use atomic operations so request handlers and sink producers
/// can record without taking the session lock.
#[derive(Default)]
pub struct SessionHealth {
    /// Frame sets received while started
    pub frames_received: AtomicU64,

    /// Frame sets handed to the backend
    pub frames_dispatched: AtomicU64,

    /// Frame sets dropped because they arrived after their slot
    pub stale_drops: AtomicU64,

    /// Single-frame sets dropped while locked in stereo mode
    pub mode_drops: AtomicU64,

    /// Entries discarded by a mono to stereo switch
    pub switch_flushes: AtomicU64,

    /// Backend calls that failed or panicked
    pub backend_failures: AtomicU64,

    /// Display/save items dropped because a sink queue was full
    pub sink_drops: AtomicU64,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_drop(&self) {
        self.stale_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mode_drop(&self) {
        self.mode_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch_flush(&self, count: usize) {
        self.switch_flushes
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_drop(&self) {
        self.sink_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate the share of received frame sets that were dropped, in percent
    pub fn drop_rate(&self) -> f64 {
        let received = self.frames_received.load(Ordering::Relaxed);
        if received == 0 {
            return 0.0;
        }
        let dropped = self.stale_drops.load(Ordering::Relaxed)
            + self.mode_drops.load(Ordering::Relaxed)
            + self.switch_flushes.load(Ordering::Relaxed);
        (dropped as f64 / received as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
            mode_drops: self.mode_drops.load(Ordering::Relaxed),
            switch_flushes: self.switch_flushes.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            sink_drops: self.sink_drops.load(Ordering::Relaxed),
            drop_rate: self.drop_rate(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub frames_received: u64,
    pub frames_dispatched: u64,
    pub stale_drops: u64,
    pub mode_drops: u64,
    pub switch_flushes: u64,
    pub backend_failures: u64,
    pub sink_drops: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} received, {} dispatched ({} stale, {} mode, {} flushed, {:.2}% dropped), {} backend failures, {} sink drops",
            self.frames_received,
            self.frames_dispatched,
            self.stale_drops,
            self.mode_drops,
            self.switch_flushes,
            self.drop_rate,
            self.backend_failures,
            self.sink_drops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = SessionHealth::new();

        for _ in 0..4 {
            health.record_received();
        }
        health.record_dispatched();
        health.record_stale_drop();
        health.record_mode_drop();

        let summary = health.summary();
        assert_eq!(summary.frames_received, 4);
        assert_eq!(summary.frames_dispatched, 1);
        assert_eq!(summary.stale_drops, 1);
        assert_eq!(summary.mode_drops, 1);
        assert!((summary.drop_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_drop_rate() {
        assert_eq!(SessionHealth::new().drop_rate(), 0.0);
    }
}
