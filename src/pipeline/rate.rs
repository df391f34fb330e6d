//! Request rate measurement

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::assets::{RATE_COMPUTE_PERIOD, RATE_WINDOW_SIZE};

/// Sliding-window rate meter
///
/// Keeps the last `window` inter-arrival deltas and recomputes the rate at
/// most once per `period`; in between, `update` returns the cached value.
pub struct RateMeter {
    deltas: VecDeque<Duration>,
    window: usize,
    period: Duration,
    last_tick: Option<Instant>,
    last_computed: Option<Instant>,
    current: f32,
}

impl RateMeter {
    pub fn new(window: usize, period: Duration) -> Self {
        Self {
            deltas: VecDeque::with_capacity(window + 1),
            window: window.max(1),
            period,
            last_tick: None,
            last_computed: None,
            current: 0.0,
        }
    }

    /// Record one event now and return the current rate (events per second)
    pub fn update(&mut self) -> f32 {
        self.update_at(Instant::now())
    }

    /// Record one event at `now` and return the current rate
    pub fn update_at(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last_tick {
            self.deltas.push_back(now.saturating_duration_since(last));
            if self.deltas.len() > self.window {
                self.deltas.pop_front();
            }
        }
        self.last_tick = Some(now);

        let due = self
            .last_computed
            .is_none_or(|computed| now.saturating_duration_since(computed) > self.period);

        if due && !self.deltas.is_empty() {
            let total: Duration = self.deltas.iter().sum();
            let mean = total.as_secs_f32() / self.deltas.len() as f32;
            if mean > 0.0 {
                self.current = 1.0 / mean;
            }
            self.last_computed = Some(now);
        }

        self.current
    }

    pub fn reset(&mut self) {
        self.deltas.clear();
        self.last_tick = None;
        self.last_computed = None;
        self.current = 0.0;
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(RATE_WINDOW_SIZE, RATE_COMPUTE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_rate() {
        let mut meter = RateMeter::new(10, Duration::ZERO);
        let base = Instant::now();

        assert_eq!(meter.update_at(base), 0.0);
        let mut fps = 0.0;
        for i in 1..=5 {
            fps = meter.update_at(base + Duration::from_millis(100 * i));
        }
        assert!((fps - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_rate_is_cached_within_period() {
        let mut meter = RateMeter::new(10, Duration::from_secs(1));
        let base = Instant::now();

        meter.update_at(base);
        let first = meter.update_at(base + Duration::from_millis(50));
        assert!((first - 20.0).abs() < 0.01);

        // faster events inside the period do not change the reported rate
        let cached = meter.update_at(base + Duration::from_millis(60));
        assert_eq!(cached, first);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut meter = RateMeter::new(2, Duration::ZERO);
        let base = Instant::now();

        meter.update_at(base);
        meter.update_at(base + Duration::from_millis(1000));
        meter.update_at(base + Duration::from_millis(1100));
        let fps = meter.update_at(base + Duration::from_millis(1200));
        // only the two most recent 100ms deltas count
        assert!((fps - 10.0).abs() < 0.01);
    }
}
