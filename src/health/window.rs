// =============================================================================
// Rolling window — per-key event counts over the last 15 minutes
// =============================================================================
//
// One FIFO queue of timestamps per tracked key. Pruning runs on every
// mutation and read, so counts never include entries older than the window.
// All operations serialize on a single mutex.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub const ROLLING_WINDOW_SECONDS: u64 = 15 * 60;

/// The fixed set of windowed health counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKey {
    RateLimitHit,
    CandleGap,
    StreamDisconnect,
    IndicatorError,
    Decision,
    OrderReject,
    DbError,
}

impl WindowKey {
    pub const ALL: [WindowKey; 7] = [
        Self::RateLimitHit,
        Self::CandleGap,
        Self::StreamDisconnect,
        Self::IndicatorError,
        Self::Decision,
        Self::OrderReject,
        Self::DbError,
    ];

    /// Field name this counter occupies in a health evidence patch.
    pub fn counter_field(self) -> &'static str {
        match self {
            Self::RateLimitHit => "rate_limit_hits_15m",
            Self::CandleGap => "candle_gap_count_15m",
            Self::StreamDisconnect => "stream_disconnects_15m",
            Self::IndicatorError => "indicator_error_count_15m",
            Self::Decision => "decision_count_15m",
            Self::OrderReject => "order_rejects_15m",
            Self::DbError => "db_error_count_15m",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::RateLimitHit => 0,
            Self::CandleGap => 1,
            Self::StreamDisconnect => 2,
            Self::IndicatorError => 3,
            Self::Decision => 4,
            Self::OrderReject => 5,
            Self::DbError => 6,
        }
    }
}

pub struct HealthWindow {
    duration: Duration,
    buckets: Mutex<[VecDeque<Instant>; 7]>,
}

impl Default for HealthWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(ROLLING_WINDOW_SECONDS))
    }
}

impl HealthWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            buckets: Mutex::new(Default::default()),
        }
    }

    pub fn inc(&self, key: WindowKey) {
        self.inc_at(key, Instant::now());
    }

    pub fn inc_at(&self, key: WindowKey, ts: Instant) {
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[key.index()];
        bucket.push_back(ts);
        Self::prune(bucket, ts, self.duration);
    }

    pub fn count(&self, key: WindowKey) -> usize {
        self.count_at(key, Instant::now())
    }

    pub fn count_at(&self, key: WindowKey, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[key.index()];
        Self::prune(bucket, now, self.duration);
        bucket.len()
    }

    /// All counter fields (zeros included) for merging into a flush patch.
    pub fn snapshot_at(&self, now: Instant) -> Vec<(&'static str, usize)> {
        let mut buckets = self.buckets.lock();
        WindowKey::ALL
            .iter()
            .map(|key| {
                let bucket = &mut buckets[key.index()];
                Self::prune(bucket, now, self.duration);
                (key.counter_field(), bucket.len())
            })
            .collect()
    }

    fn prune(bucket: &mut VecDeque<Instant>, now: Instant, duration: Duration) {
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) > duration {
                bucket.pop_front();
            } else {
                break;
            }
        }
    }
}
