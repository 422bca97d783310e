//! Exponentially decaying uptime meters.
//!
//! An [`IntervalMeter`] estimates the fraction of recent time an entity has
//! been observed running. Time is cut into half-life periods; at every
//! period boundary the accumulated value is halved, and running time inside
//! a period contributes at most one half.

use {
    crate::config::DEFAULT_UPTIME_MAX_SKIPPED_PERIODS,
    std::time::{Duration, Instant},
};

// Keeps `2^skipped` exactly representable.
const MAX_SKIPPED_PERIODS_LIMIT: u32 = 63;

/// A time-series accumulator driven by explicit timestamps.
///
/// Timestamps must be non-decreasing; a `now` at or before the last update
/// leaves the meter unchanged.
pub trait Meter {
    /// Mark the entity as running from `now`. No-op if already running.
    fn start(&mut self, now: Instant);

    /// Mark the entity as stopped from `now`. No-op if already stopped.
    fn stop(&mut self, now: Instant);

    /// Advance the meter to `now` and return its value, in `[0, 1]`.
    fn read(&mut self, now: Instant) -> f64;
}

/// Half-life based [`Meter`].
#[derive(Debug, Clone)]
pub struct IntervalMeter {
    running: bool,
    halflife: Duration,
    max_skipped_periods: u32,
    value: f64,
    next_halvening: Instant,
    /// `None` until the first read.
    last_updated: Option<Instant>,
}

impl IntervalMeter {
    pub fn new(halflife: Duration) -> Self {
        Self::with_max_skipped_periods(halflife, DEFAULT_UPTIME_MAX_SKIPPED_PERIODS)
    }

    /// A meter that jumps to its steady-state value once more than
    /// `max_skipped_periods` whole half-lives pass between reads.
    pub fn with_max_skipped_periods(halflife: Duration, max_skipped_periods: u32) -> Self {
        let now = Instant::now();
        Self {
            running: false,
            halflife: halflife.max(Duration::from_nanos(1)),
            max_skipped_periods: max_skipped_periods.min(MAX_SKIPPED_PERIODS_LIMIT),
            value: 0.0,
            next_halvening: now,
            last_updated: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn halflife(&self) -> Duration {
        self.halflife
    }

    fn reset(&mut self, now: Instant) -> f64 {
        self.value = if self.running { 1.0 } else { 0.0 };
        self.last_updated = Some(now);
        self.next_halvening = later(now, self.halflife);
        self.value
    }

    fn fraction_of_halflife(&self, elapsed: Duration) -> f64 {
        elapsed.as_secs_f64() / self.halflife.as_secs_f64()
    }
}

impl Meter for IntervalMeter {
    fn start(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.read(now);
        self.running = true;
    }

    fn stop(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        self.read(now);
        self.running = false;
    }

    fn read(&mut self, now: Instant) -> f64 {
        let Some(mut last_updated) = self.last_updated else {
            // Never read: treat as an arbitrarily long gap.
            return self.reset(now);
        };
        if now <= last_updated {
            return self.value;
        }

        // Close out the current period.
        if now > self.next_halvening {
            if self.running {
                let ran = self.next_halvening.saturating_duration_since(last_updated);
                self.value += self.fraction_of_halflife(ran) / 2.0;
            }
            last_updated = self.next_halvening;
            self.next_halvening = later(self.next_halvening, self.halflife);
            self.value /= 2.0;

            // Skip whole periods in closed form.
            let gap = now.saturating_duration_since(last_updated);
            if gap > self.halflife {
                let skipped = gap
                    .as_nanos()
                    .checked_div(self.halflife.as_nanos())
                    .unwrap_or_default();
                if skipped > u128::from(self.max_skipped_periods) {
                    return self.reset(now);
                }
                // Bounded by `max_skipped_periods` above.
                let skipped = skipped as u32;
                let factor = 0.5f64.powi(skipped as i32);
                self.value *= factor;
                if self.running {
                    self.value += 1.0 - factor;
                }
                self.value /= 2.0;
                let skipped_duration = self.halflife.saturating_mul(skipped);
                last_updated = later(last_updated, skipped_duration);
                self.next_halvening = later(self.next_halvening, skipped_duration);
            }
        }

        // Partial period up to `now`.
        if self.running {
            let ran = now.saturating_duration_since(last_updated);
            self.value += self.fraction_of_halflife(ran) / 2.0;
        }
        self.value = self.value.clamp(0.0, 1.0);
        self.last_updated = Some(now);
        self.value
    }
}

fn later(t: Instant, by: Duration) -> Instant {
    t.checked_add(by).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_start_read_stop_read() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::new(SECOND);
        meter.start(t0);
        assert!(approx_eq(meter.read(t0 + SECOND), 0.5));
        meter.stop(t0 + SECOND);
        assert!(approx_eq(meter.read(t0 + 2 * SECOND), 0.25));
    }

    #[test]
    fn test_halflife_step_moves_halfway_to_one() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::new(SECOND);
        meter.start(t0);
        let mut expected = 0.0;
        for i in 1..=5u32 {
            expected = (expected + 1.0) / 2.0;
            assert!(approx_eq(meter.read(t0 + i * SECOND), expected));
        }
    }

    #[test]
    fn test_start_stop_idempotent() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::new(SECOND);
        meter.start(t0);
        meter.start(t0 + SECOND / 2);
        assert!(meter.is_running());
        assert!(approx_eq(meter.read(t0 + SECOND), 0.5));

        meter.stop(t0 + SECOND);
        meter.stop(t0 + SECOND + SECOND / 2);
        assert!(!meter.is_running());
        assert!(approx_eq(meter.read(t0 + 2 * SECOND), 0.25));
    }

    #[test]
    fn test_stale_read_is_noop() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::new(SECOND);
        meter.start(t0);
        let v = meter.read(t0 + SECOND);
        assert!(approx_eq(meter.read(t0), v));
        assert!(approx_eq(meter.read(t0 + SECOND / 2), v));
    }

    #[test]
    fn test_closed_form_skip() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::new(SECOND);
        meter.start(t0);
        // Boundary at 1s, then 3 whole periods skipped, then half a period.
        let v = meter.read(t0 + 4 * SECOND + SECOND / 2);
        // 0.5 after the first period, halved, decayed by 1/8 toward one,
        // halved, plus a quarter for the partial period.
        let after_first = 0.5 / 2.0;
        let factor = 1.0 / 8.0;
        let expected = (after_first * factor + (1.0 - factor)) / 2.0 + 0.25;
        assert!(approx_eq(v, expected));
        assert!(v <= 1.0);
    }

    #[test]
    fn test_long_gap_jumps_to_steady_state() {
        let t0 = Instant::now();
        let mut running = IntervalMeter::new(SECOND);
        running.start(t0);
        assert_eq!(running.read(t0 + 100 * SECOND), 1.0);

        let mut stopped = IntervalMeter::new(SECOND);
        stopped.start(t0);
        stopped.stop(t0 + SECOND);
        assert_eq!(stopped.read(t0 + 100 * SECOND), 0.0);
    }

    #[test]
    fn test_skip_ceiling_is_configurable() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::with_max_skipped_periods(SECOND, 2);
        meter.start(t0);
        meter.stop(t0 + SECOND);
        // Five whole periods after the boundary exceed a ceiling of two.
        assert_eq!(meter.read(t0 + 6 * SECOND), 0.0);

        let mut meter = IntervalMeter::new(SECOND);
        meter.start(t0);
        meter.stop(t0 + SECOND);
        assert!(meter.read(t0 + 6 * SECOND) > 0.0);
    }

    #[test]
    fn test_value_stays_in_unit_interval() {
        let t0 = Instant::now();
        let mut meter = IntervalMeter::new(Duration::from_millis(300));
        let mut now = t0;
        for step in 0..200u64 {
            now += Duration::from_millis(step.wrapping_mul(37) % 1_100);
            if step % 3 == 0 {
                meter.start(now);
            } else if step % 5 == 0 {
                meter.stop(now);
            }
            let v = meter.read(now);
            assert!((0.0..=1.0).contains(&v), "value {v} out of range");
        }
    }

    #[test]
    fn test_zero_halflife_clamped() {
        let meter = IntervalMeter::new(Duration::ZERO);
        assert_eq!(meter.halflife(), Duration::from_nanos(1));
    }
}
