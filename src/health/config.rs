// =============================================================================
// Health flush policy constants
// =============================================================================

use std::time::Duration;

use crate::config::PollingTier;

/// Minimum spacing between any two flushes, forced included.
pub const DEBOUNCE: Duration = Duration::from_secs(3);
/// Deferred critical flushes land at least this far in the future.
pub const CRITICAL_DELAY: Duration = Duration::from_secs(1);
/// Cadence of the background flush loop.
pub const FLUSH_LOOP_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic flush interval by tier and in-position state. In-position bots
/// report faster: position evidence goes stale quicker than idle evidence.
pub fn flush_interval(tier: PollingTier, in_position: bool) -> Duration {
    let seconds = match (tier, in_position) {
        (PollingTier::Fast5s, false) => 60,
        (PollingTier::Fast5s, true) => 20,
        (PollingTier::Ultra15s, false) => 90,
        (PollingTier::Ultra15s, true) => 45,
        (PollingTier::Fast30s, false) => 120,
        (PollingTier::Fast30s, true) => 75,
        (PollingTier::Standard, false) => 180,
        (PollingTier::Standard, true) => 150,
    };
    Duration::from_secs(seconds)
}
