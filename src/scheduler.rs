// =============================================================================
// Jitter-aware polling scheduler
// =============================================================================
//
// Drift-free cadence: each tick sleeps until `started_at + interval` on the
// monotonic clock, so time spent inside the tick is absorbed. An overrunning
// tick yields a zero sleep; the scheduler never runs back-to-back to catch up.
//
// Intervals are `max(min, base + U[-jitter, +jitter])` — symmetric jitter
// with a floor that guarantees positive cadence.
// =============================================================================

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::MIN_POLL_SECONDS;

pub struct JitterScheduler {
    base: f64,
    jitter: f64,
    min: f64,
}

impl JitterScheduler {
    /// `min_seconds` is clamped to the global poll floor; `base_seconds` can
    /// never drop below the resulting minimum.
    pub fn new(base_seconds: u64, jitter_seconds: u64, min_seconds: Option<u64>) -> Self {
        let min = min_seconds.unwrap_or(MIN_POLL_SECONDS).max(MIN_POLL_SECONDS) as f64;
        Self {
            base: (base_seconds as f64).max(min),
            jitter: jitter_seconds as f64,
            min,
        }
    }

    /// Sleep a uniform-random delay in [0, base). Called once at boot so a
    /// fleet of workers restarting together does not thunder the exchange.
    pub async fn startup_stagger(&self) {
        let delay = rand::thread_rng().gen_range(0.0..self.base);
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    /// Compute the next interval, updating the held parameters when overrides
    /// are provided (the loop passes the hot-reloaded poll cadence here).
    pub fn next_interval(
        &mut self,
        base_override: Option<u64>,
        jitter_override: Option<u64>,
        min_override: Option<u64>,
    ) -> f64 {
        if let Some(min) = min_override {
            self.min = (min as f64).max(MIN_POLL_SECONDS as f64);
        }
        if let Some(base) = base_override {
            self.base = (base as f64).max(self.min);
        }
        if let Some(jitter) = jitter_override {
            self.jitter = jitter as f64;
        }
        if self.jitter < 0.0 {
            self.jitter = 0.0;
        }

        let delta = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        (self.base + delta).max(self.min)
    }

    /// Sleep until `started_at + interval`. Zero sleep if the tick overran.
    pub async fn sleep_for(&self, interval: f64, started_at: Instant) {
        let target = started_at + Duration::from_secs_f64(interval);
        tokio::time::sleep_until(target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_never_below_min() {
        let mut s = JitterScheduler::new(60, 10, Some(30));
        for _ in 0..500 {
            let interval = s.next_interval(None, None, None);
            assert!(interval >= 30.0, "interval {interval} below min");
            assert!(interval <= 70.0, "interval {interval} above base+jitter");
        }
    }

    #[test]
    fn interval_floor_holds_under_random_parameters() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let base = rng.gen_range(1..600);
            let jitter = rng.gen_range(0..120);
            let min = rng.gen_range(MIN_POLL_SECONDS..120);
            let mut s = JitterScheduler::new(base, jitter, Some(min));
            let interval = s.next_interval(None, None, None);
            assert!(interval >= min as f64);
            assert!(interval >= MIN_POLL_SECONDS as f64);
        }
    }

    #[test]
    fn min_clamped_to_global_floor() {
        let mut s = JitterScheduler::new(1, 0, Some(0));
        let interval = s.next_interval(None, None, None);
        assert!(interval >= MIN_POLL_SECONDS as f64);
    }

    #[test]
    fn overrides_are_retained() {
        let mut s = JitterScheduler::new(60, 0, Some(30));
        let first = s.next_interval(Some(120), Some(0), None);
        assert_eq!(first, 120.0);
        // No overrides on the next call: the updated base sticks.
        let second = s.next_interval(None, None, None);
        assert_eq!(second, 120.0);
    }

    #[test]
    fn base_override_floored_at_min() {
        let mut s = JitterScheduler::new(300, 0, Some(60));
        let interval = s.next_interval(Some(10), Some(0), None);
        assert_eq!(interval, 60.0);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let mut s = JitterScheduler::new(90, 0, Some(30));
        for _ in 0..10 {
            assert_eq!(s.next_interval(None, None, None), 90.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_absorbs_time_spent_in_tick() {
        let s = JitterScheduler::new(60, 0, Some(30));
        let started_at = Instant::now();
        // Simulate 20s of tick work.
        tokio::time::advance(Duration::from_secs(20)).await;
        let before = Instant::now();
        s.sleep_for(60.0, started_at).await;
        let slept = Instant::now() - before;
        assert!((slept.as_secs_f64() - 40.0).abs() < 0.5, "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_tick_sleeps_zero() {
        let s = JitterScheduler::new(60, 0, Some(30));
        let started_at = Instant::now();
        tokio::time::advance(Duration::from_secs(90)).await;
        let before = Instant::now();
        s.sleep_for(60.0, started_at).await;
        let slept = Instant::now() - before;
        assert!(slept.as_secs_f64() < 0.5, "expected zero sleep, got {slept:?}");
    }
}
